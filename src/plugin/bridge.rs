//! Manifest and config bridges
//!
//! Wrappers holding the current manifest (or config list) plus an updater.
//! Every successful write hands the updater the complete new snapshot,
//! exactly once, before the write returns. Writes to read-only manifest
//! fields fail without touching the updater.
//!
//! Updaters run while the bridge lock is held, so snapshots reach them in
//! write order. An updater must not call back into the bridge that invoked it.

use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use thiserror::Error;

use super::types::{ConfigKind, ServiceConfig, ServiceManifest};

/// Manifest fields guests may never change
pub const READ_ONLY_FIELDS: &[&str] = &[
    "id",
    "originalId",
    "version",
    "mainChecksums",
    "minApiVersion",
    "maxApiVersion",
    "main",
    "source",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("Manifest field '{0}' is read-only")]
    ReadOnlyField(String),

    #[error("Unknown manifest field '{0}'")]
    UnknownField(String),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl BridgeError {
    /// Error name seen by guest code
    pub fn guest_name(&self) -> &'static str {
        match self {
            BridgeError::ReadOnlyField(_) => "ReadOnlyFieldError",
            BridgeError::UnknownField(_) => "UnknownFieldError",
            BridgeError::InvalidValue { .. } => "TypeError",
        }
    }
}

/// Receives the full manifest after each write
pub trait ManifestUpdater: Send + Sync {
    fn update(&self, manifest: &ServiceManifest);
}

/// Receives the full config list after each write
pub trait ConfigUpdater: Send + Sync {
    fn update(&self, configs: &[ServiceConfig]);
}

impl<F> ManifestUpdater for F
where
    F: Fn(&ServiceManifest) + Send + Sync,
{
    fn update(&self, manifest: &ServiceManifest) {
        self(manifest)
    }
}

impl<F> ConfigUpdater for F
where
    F: Fn(&[ServiceConfig]) + Send + Sync,
{
    fn update(&self, configs: &[ServiceConfig]) {
        self(configs)
    }
}

/// Updater that discards every snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUpdater;

impl ManifestUpdater for NoopUpdater {
    fn update(&self, _manifest: &ServiceManifest) {}
}

impl ConfigUpdater for NoopUpdater {
    fn update(&self, _configs: &[ServiceConfig]) {}
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn optional_string(field: &str, value: Value) -> Result<Option<String>, BridgeError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        other => Err(BridgeError::InvalidValue {
            field: field.to_string(),
            reason: format!("expected a string or null, got {}", other),
        }),
    }
}

/// Observer wrapper around a service manifest
pub struct ManifestBridge {
    state: Mutex<ServiceManifest>,
    updater: Arc<dyn ManifestUpdater>,
    configs: OnceLock<Weak<ConfigBridge>>,
}

impl ManifestBridge {
    pub fn new(manifest: ServiceManifest, updater: Arc<dyn ManifestUpdater>) -> Self {
        Self {
            state: Mutex::new(manifest),
            updater,
            configs: OnceLock::new(),
        }
    }

    /// Forward later `configs` writes to `configs`, so both views share one
    /// list. Only the first link takes effect.
    pub fn link_configs(&self, configs: &Arc<ConfigBridge>) {
        let _ = self.configs.set(Arc::downgrade(configs));
    }

    /// Current manifest
    pub fn snapshot(&self) -> ServiceManifest {
        lock(&self.state).clone()
    }

    /// Read a field by its JSON name
    pub fn get(&self, field: &str) -> Option<Value> {
        serde_json::to_value(self.snapshot())
            .ok()
            .and_then(|mut v| v.get_mut(field).map(Value::take))
    }

    pub fn is_read_only(field: &str) -> bool {
        READ_ONLY_FIELDS.contains(&field)
    }

    fn write<F>(&self, apply: F) -> ServiceManifest
    where
        F: FnOnce(&mut ServiceManifest),
    {
        let mut state = lock(&self.state);
        apply(&mut state);
        let snapshot = state.clone();
        self.updater.update(&snapshot);
        snapshot
    }

    pub fn set_name(&self, name: impl Into<String>) -> ServiceManifest {
        let name = name.into();
        self.write(|m| m.name = name)
    }

    pub fn set_description(&self, description: Option<String>) -> ServiceManifest {
        self.write(|m| m.description = description)
    }

    pub fn set_icon(&self, icon: Option<String>) -> ServiceManifest {
        self.write(|m| m.icon = icon)
    }

    pub fn set_homepage(&self, homepage: Option<String>) -> ServiceManifest {
        self.write(|m| m.homepage = homepage)
    }

    pub fn set_author(&self, author: Option<String>) -> ServiceManifest {
        self.write(|m| m.author = author)
    }

    pub fn set_configs(&self, configs: Option<Vec<ServiceConfig>>) -> ServiceManifest {
        let list = configs.clone().unwrap_or_default();
        let snapshot = self.write(|m| m.configs = configs);
        if let Some(bridge) = self.configs.get().and_then(Weak::upgrade) {
            bridge.replace(list);
        }
        snapshot
    }

    pub fn set_force_config_validation(&self, force: bool) -> ServiceManifest {
        self.write(|m| m.force_config_validation = force)
    }

    /// Replace the configs without notifying the updater. Used to keep the
    /// manifest in step with writes already reported by the config bridge.
    pub fn refresh_configs(&self, configs: &[ServiceConfig]) {
        let mut state = lock(&self.state);
        if configs.is_empty() && state.configs.is_none() {
            return;
        }
        state.configs = Some(configs.to_vec());
    }

    /// Write a field by its JSON name, as guest code does.
    ///
    /// Returns the stored value of the field.
    pub fn set_field(&self, field: &str, value: Value) -> Result<Value, BridgeError> {
        if Self::is_read_only(field) {
            return Err(BridgeError::ReadOnlyField(field.to_string()));
        }

        let snapshot = match field {
            "name" => match value {
                Value::String(name) => self.set_name(name),
                other => {
                    return Err(BridgeError::InvalidValue {
                        field: field.to_string(),
                        reason: format!("expected a string, got {}", other),
                    })
                }
            },
            "description" => self.set_description(optional_string(field, value)?),
            "icon" => self.set_icon(optional_string(field, value)?),
            "homepage" => self.set_homepage(optional_string(field, value)?),
            "author" => self.set_author(optional_string(field, value)?),
            "configs" => {
                let configs: Option<Vec<ServiceConfig>> = serde_json::from_value(value)
                    .map_err(|e| BridgeError::InvalidValue {
                        field: field.to_string(),
                        reason: e.to_string(),
                    })?;
                self.set_configs(configs)
            }
            "forceConfigValidation" => match value {
                Value::Bool(force) => self.set_force_config_validation(force),
                other => {
                    return Err(BridgeError::InvalidValue {
                        field: field.to_string(),
                        reason: format!("expected a boolean, got {}", other),
                    })
                }
            },
            other => return Err(BridgeError::UnknownField(other.to_string())),
        };

        Ok(serde_json::to_value(&snapshot)
            .ok()
            .and_then(|mut v| v.get_mut(field).map(Value::take))
            .unwrap_or(Value::Null))
    }
}

/// Observer wrapper around a service's config list, keyed by config key
pub struct ConfigBridge {
    state: Mutex<Vec<ServiceConfig>>,
    updater: Arc<dyn ConfigUpdater>,
}

impl ConfigBridge {
    pub fn new(configs: Vec<ServiceConfig>, updater: Arc<dyn ConfigUpdater>) -> Self {
        Self {
            state: Mutex::new(configs),
            updater,
        }
    }

    pub fn snapshot(&self) -> Vec<ServiceConfig> {
        lock(&self.state).clone()
    }

    /// Current value of a config
    pub fn get(&self, key: &str) -> Option<String> {
        lock(&self.state)
            .iter()
            .find(|c| c.key == key)
            .and_then(|c| c.value.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.state).iter().map(|c| c.key.clone()).collect()
    }

    /// Set a config value. Unknown keys are appended as text configs.
    pub fn set(&self, key: &str, value: Option<String>) -> Vec<ServiceConfig> {
        self.set_with_kind(key, value, ConfigKind::Text)
    }

    fn set_with_kind(
        &self,
        key: &str,
        value: Option<String>,
        kind_for_new: ConfigKind,
    ) -> Vec<ServiceConfig> {
        let mut state = lock(&self.state);
        match state.iter_mut().find(|c| c.key == key) {
            Some(config) => config.value = value,
            None => {
                let mut config = ServiceConfig::new(key, kind_for_new);
                config.value = value;
                state.push(config);
            }
        }
        let snapshot = state.clone();
        self.updater.update(&snapshot);
        snapshot
    }

    /// Replace the whole list, as a manifest `configs` write does
    pub fn replace(&self, configs: Vec<ServiceConfig>) -> Vec<ServiceConfig> {
        let mut state = lock(&self.state);
        *state = configs;
        let snapshot = state.clone();
        self.updater.update(&snapshot);
        snapshot
    }

    /// Set a config from a guest-supplied JSON value.
    ///
    /// Values are stored as strings; a new key gets a kind inferred from the
    /// JSON type.
    pub fn set_json(&self, key: &str, value: Value) -> Vec<ServiceConfig> {
        let kind = match &value {
            Value::Bool(_) => ConfigKind::Boolean,
            Value::Number(_) => ConfigKind::Number,
            _ => ConfigKind::Text,
        };
        let value = match value {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        };
        self.set_with_kind(key, value, kind)
    }
}
