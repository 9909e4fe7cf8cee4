//! Service installation
//!
//! Installs a service from a manifest locator: the manifest is fetched, its
//! API bounds are checked, the entry script is loaded and verified against
//! the pinned checksums, existing config values are carried over on upgrade,
//! and the result is stored. Bundled services are discovered under the assets
//! root.

use semver::Version;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::checksum::IntegrityError;
use super::loader::{CodeLoader, LoadError, Locator, ASSET_SCHEME};
use super::repository::{ManifestRepository, RepositoryError};
use super::types::{ServiceConfig, ServiceManifest, ServiceSource, ValidationResult, HOST_API_VERSION};
use super::validator::ConfigValidator;

/// Directory under the assets root holding bundled services
pub const BUNDLED_DIR: &str = "services";

/// Manifest file name of a bundled service
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Failed to fetch: {0}")]
    Load(LoadError),

    #[error("Entry script rejected: {0}")]
    Integrity(IntegrityError),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Service '{id}' does not support host API version {host}")]
    Incompatible { id: String, host: u32 },

    #[error("Refusing to replace {id} {installed} with older version {candidate}")]
    Downgrade {
        id: String,
        installed: String,
        candidate: String,
    },

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl From<LoadError> for InstallError {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::Integrity(e) => InstallError::Integrity(e),
            other => InstallError::Load(other),
        }
    }
}

/// What an install did
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    /// Manifest as stored
    pub manifest: ServiceManifest,
    /// Version that was replaced, if this was an upgrade or reinstall
    pub previous_version: Option<String>,
    /// Validator verdicts, present when the service forces validation
    pub validation: Option<Vec<ValidationResult>>,
}

impl InstallOutcome {
    pub fn is_valid(&self) -> bool {
        self.validation
            .as_ref()
            .map_or(true, |results| results.iter().all(ValidationResult::is_pass))
    }
}

fn parse_version(manifest: &ServiceManifest) -> Result<Version, InstallError> {
    Version::parse(&manifest.version).map_err(|e| {
        InstallError::InvalidManifest(format!("version '{}' is not semver: {}", manifest.version, e))
    })
}

/// Keep stored values for configs the new manifest leaves unset
fn carry_over_configs(new: &mut ServiceManifest, existing: &ServiceManifest) {
    let Some(configs) = new.configs.as_mut() else {
        return;
    };
    for config in configs.iter_mut().filter(|c| c.value.is_none()) {
        if let Some(old) = existing.config(&config.key) {
            config.value = old.value.clone();
        }
    }
}

/// Installs services into a repository
pub struct ServiceInstaller {
    loader: Arc<CodeLoader>,
    repository: Arc<dyn ManifestRepository>,
    validator: Option<ConfigValidator>,
    api_version: u32,
}

impl ServiceInstaller {
    pub fn new(loader: Arc<CodeLoader>, repository: Arc<dyn ManifestRepository>) -> Self {
        Self {
            loader,
            repository,
            validator: None,
            api_version: HOST_API_VERSION,
        }
    }

    /// Validator to run for services with `forceConfigValidation`
    pub fn with_validator(mut self, validator: ConfigValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn repository(&self) -> &Arc<dyn ManifestRepository> {
        &self.repository
    }

    /// Fetch a manifest and install it
    pub async fn install(&self, locator: &str) -> Result<InstallOutcome, InstallError> {
        info!(locator, "Installing service");

        let bytes = self.loader.fetch_bytes(locator).await?;
        let manifest: ServiceManifest = serde_json::from_slice(&bytes)
            .map_err(|e| InstallError::InvalidManifest(e.to_string()))?;

        self.install_manifest(manifest).await
    }

    /// Install an already parsed manifest
    pub async fn install_manifest(&self, mut manifest: ServiceManifest) -> Result<InstallOutcome, InstallError> {
        if manifest.id.trim().is_empty() {
            return Err(InstallError::InvalidManifest("id must not be empty".to_string()));
        }
        let candidate_version = parse_version(&manifest)?;

        if !manifest.supports_api(self.api_version) {
            return Err(InstallError::Incompatible {
                id: manifest.id,
                host: self.api_version,
            });
        }

        // Fails on checksum mismatch before anything is stored
        self.loader.load(&manifest.main_checksums, &manifest.main).await?;

        let existing = match self.repository.find_by_original_id(manifest.stable_id()).await? {
            Some(found) => Some(found),
            None => self.repository.get(&manifest.id).await?,
        };

        let previous_version = match &existing {
            Some(existing) => {
                if let Ok(installed) = Version::parse(&existing.version) {
                    if candidate_version < installed {
                        return Err(InstallError::Downgrade {
                            id: manifest.id,
                            installed: existing.version.clone(),
                            candidate: manifest.version,
                        });
                    }
                }
                carry_over_configs(&mut manifest, existing);
                Some(existing.version.clone())
            }
            None => None,
        };

        let validation = match (&self.validator, manifest.force_config_validation) {
            (Some(validator), true) => {
                let configs: Vec<ServiceConfig> = manifest.configs().to_vec();
                let results = validator.validate(&manifest, &configs, true).await;
                let failed = results.iter().filter(|r| !r.is_pass()).count();
                if failed > 0 {
                    warn!(service = %manifest.id, failed, "Installed service has invalid configs");
                }
                Some(results)
            }
            (None, true) => {
                debug!(service = %manifest.id, "No validator configured, skipping forced validation");
                None
            }
            _ => None,
        };

        self.repository.upsert(&manifest).await?;
        if let Some(existing) = &existing {
            if existing.id != manifest.id {
                self.repository.remove(&existing.id).await?;
            }
        }

        info!(
            service = %manifest.id,
            version = %manifest.version,
            previous = ?previous_version,
            "Service installed"
        );

        Ok(InstallOutcome {
            manifest,
            previous_version,
            validation,
        })
    }

    /// Install every bundled service found under the loader's assets root.
    ///
    /// Each service is installed independently; failures are returned next
    /// to the id they belong to.
    pub async fn install_bundled(&self) -> Result<Vec<(String, Result<InstallOutcome, InstallError>)>, InstallError> {
        let manifests = discover_bundled(self.loader.assets_dir()).await?;
        let mut results = Vec::with_capacity(manifests.len());
        for manifest in manifests {
            let id = manifest.id.clone();
            let result = self.install_manifest(manifest).await;
            if let Err(e) = &result {
                warn!(service = %id, "Failed to install bundled service: {}", e);
            }
            results.push((id, result));
        }
        Ok(results)
    }
}

/// Find bundled services under `<assets_dir>/services/*/manifest.json`.
///
/// Discovered manifests are marked [`ServiceSource::Builtin`]. A relative
/// `main` is resolved against the service's own directory.
pub async fn discover_bundled(assets_dir: &Path) -> Result<Vec<ServiceManifest>, InstallError> {
    let root = assets_dir.join(BUNDLED_DIR);
    let mut entries = match tokio::fs::read_dir(&root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(InstallError::Load(LoadError::Io(e))),
    };

    let mut manifests = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| InstallError::Load(LoadError::Io(e)))?
    {
        let dir_name = entry.file_name().to_string_lossy().to_string();
        let path = entry.path().join(MANIFEST_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(InstallError::Load(LoadError::Io(e))),
        };

        let mut manifest: ServiceManifest = match serde_json::from_slice(&bytes) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(path = %path.display(), "Skipping invalid bundled manifest: {}", e);
                continue;
            }
        };

        if Locator::parse(&manifest.main).is_err() {
            manifest.main = format!("{}{}/{}/{}", ASSET_SCHEME, BUNDLED_DIR, dir_name, manifest.main);
        }
        manifest.source = ServiceSource::Builtin;
        debug!(service = %manifest.id, main = %manifest.main, "Discovered bundled service");
        manifests.push(manifest);
    }

    manifests.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(manifests)
}
