//! Config validation pipeline
//!
//! Stage one checks every config against its declared kind without running
//! any guest code. Stage two, when requested, seeds a fresh session with the
//! candidate values and asks the service's own `ValidateFeature`. Both stages
//! return exactly one [`ValidationResult`] per input config, in input order.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::bridge::NoopUpdater;
use super::features::Capability;
use super::operations::{ConfigFailure, FetchError};
use super::runner::{RunError, ServiceRunner};
use super::types::{ConfigKind, ServiceConfig, ServiceManifest, ValidationResult};

pub const REQUIRED_MESSAGE: &str = "This field is required";
pub const COOKIE_REQUIRED_MESSAGE: &str = "Sign in to the service to fill in this field";
pub const BOOLEAN_MESSAGE: &str = "Value must be either true or false";
pub const NUMBER_MESSAGE: &str = "Value must be a number";
pub const URL_MESSAGE: &str = "Value must be an http:// or https:// URL";
pub const NO_OPTIONS_MESSAGE: &str = "No options are declared for this field";
pub const OPTION_MESSAGE: &str = "Value is not one of the available options";

/// Structural check of a single config
pub fn validate_config(config: &ServiceConfig) -> ValidationResult {
    if config.is_empty() {
        return match (config.required, config.kind.is_cookie()) {
            (true, true) => ValidationResult::fail(COOKIE_REQUIRED_MESSAGE),
            (true, false) => ValidationResult::fail(REQUIRED_MESSAGE),
            (false, _) => ValidationResult::Pass,
        };
    }

    let value = config.value.as_deref().unwrap_or_default().trim();

    match &config.kind {
        ConfigKind::Boolean if value != "true" && value != "false" => {
            ValidationResult::fail(BOOLEAN_MESSAGE)
        }
        ConfigKind::Number if !value.parse::<f64>().map_or(false, f64::is_finite) => {
            ValidationResult::fail(NUMBER_MESSAGE)
        }
        ConfigKind::Url if !has_http_scheme(value) => ValidationResult::fail(URL_MESSAGE),
        ConfigKind::Option { options } => match options.as_deref() {
            None | Some([]) => ValidationResult::fail(NO_OPTIONS_MESSAGE),
            Some(options) if !options.iter().any(|o| o.value == value) => {
                ValidationResult::fail(OPTION_MESSAGE)
            }
            Some(_) => ValidationResult::Pass,
        },
        _ => ValidationResult::Pass,
    }
}

fn has_http_scheme(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Structural stage over a whole config list
pub fn validate_structure(configs: &[ServiceConfig]) -> Vec<ValidationResult> {
    configs.iter().map(validate_config).collect()
}

/// Overlay `candidates` on `existing` by key.
///
/// Existing order is kept, candidate values replace existing ones, and
/// candidate keys unknown to the manifest are appended.
pub fn merge_candidates(existing: &[ServiceConfig], candidates: &[ServiceConfig]) -> Vec<ServiceConfig> {
    let mut merged: Vec<ServiceConfig> = existing.to_vec();
    for candidate in candidates {
        match merged.iter_mut().find(|c| c.key == candidate.key) {
            Some(slot) => *slot = candidate.clone(),
            None => merged.push(candidate.clone()),
        }
    }
    merged
}

/// Map guest failures back onto the input configs by key
pub fn match_failures(configs: &[ServiceConfig], failures: &[ConfigFailure]) -> Vec<ValidationResult> {
    let mut by_key: HashMap<&str, &str> = HashMap::new();
    for failure in failures {
        by_key.entry(failure.key.as_str()).or_insert(failure.message.as_str());
    }

    configs
        .iter()
        .map(|config| match by_key.get(config.key.as_str()) {
            Some(message) => ValidationResult::fail(*message),
            None => ValidationResult::Pass,
        })
        .collect()
}

/// Combine both stages; a structural failure wins over the guest verdict
pub fn merge_results(structural: Vec<ValidationResult>, plugin: Vec<ValidationResult>) -> Vec<ValidationResult> {
    structural
        .into_iter()
        .zip(plugin)
        .map(|(structural, plugin)| if structural.is_pass() { plugin } else { structural })
        .collect()
}

fn degrade_all(count: usize, message: &str) -> Vec<ValidationResult> {
    vec![ValidationResult::fail(message); count]
}

fn fault_message(err: &FetchError) -> String {
    match err {
        FetchError::Plugin { message, .. } | FetchError::Unsupported { message } => message.clone(),
        other => other.to_string(),
    }
}

/// Two-stage validator bound to a runner
#[derive(Debug, Clone)]
pub struct ConfigValidator {
    runner: ServiceRunner,
}

impl ConfigValidator {
    pub fn new(runner: ServiceRunner) -> Self {
        Self { runner }
    }

    /// Validate `candidates` for `manifest`.
    ///
    /// With `run_plugin` set and a `validate` capability registered by the
    /// service, the guest validator runs against the candidates merged over
    /// the stored configs. Any failure of that stage marks every config as
    /// failed.
    pub async fn validate(
        &self,
        manifest: &ServiceManifest,
        candidates: &[ServiceConfig],
        run_plugin: bool,
    ) -> Vec<ValidationResult> {
        let structural = validate_structure(candidates);
        if !run_plugin {
            return structural;
        }

        let plugin = self.plugin_stage(manifest, candidates).await;
        merge_results(structural, plugin)
    }

    async fn plugin_stage(&self, manifest: &ServiceManifest, candidates: &[ServiceConfig]) -> Vec<ValidationResult> {
        let merged = merge_candidates(manifest.configs(), candidates);
        let mut seeded = manifest.clone();
        seeded.configs = Some(merged.clone());

        let outcome = self
            .runner
            .run(seeded, Arc::new(NoopUpdater), Arc::new(NoopUpdater), |session| async move {
                if !session.is_registered(&Capability::Validate) {
                    return Ok(None);
                }
                session.validate_configs(&merged).await.map(Some)
            })
            .await;

        match outcome {
            Ok(Ok(None)) => {
                debug!(service = %manifest.id, "Service has no validator, skipping plugin stage");
                vec![ValidationResult::Pass; candidates.len()]
            }
            Ok(Ok(Some(failures))) => {
                debug!(service = %manifest.id, failures = failures.len(), "Service validator finished");
                match_failures(candidates, &failures)
            }
            Ok(Err(err)) => {
                warn!(service = %manifest.id, error = %err, "Service validator failed");
                degrade_all(candidates.len(), &fault_message(&err))
            }
            Err(err) => {
                warn!(service = %manifest.id, error = %err, "Could not start service for validation");
                let message = match &err {
                    RunError::Plugin { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                degrade_all(candidates.len(), &message)
            }
        }
    }
}
