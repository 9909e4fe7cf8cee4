//! Error type system
//!
//! Each component owns its error enum; [`ServiceError`] gathers them for
//! callers that deal with the runtime as a whole, such as the CLI.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::CacheError;
use crate::core::config::ConfigError;
use crate::plugin::bridge::BridgeError;
use crate::plugin::checksum::IntegrityError;
use crate::plugin::engine::EngineError;
use crate::plugin::features::FeatureError;
use crate::plugin::installer::InstallError;
use crate::plugin::loader::LoadError;
use crate::plugin::operations::FetchError;
use crate::plugin::repository::RepositoryError;
use crate::plugin::runner::RunError;
use crate::plugin::session::SessionError;

/// Main error type of the service runtime
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Feature(#[from] FeatureError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Service not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    /// Stable tag for machine-readable output
    pub fn error_type(&self) -> &'static str {
        match self {
            ServiceError::Config(_) => "ConfigError",
            ServiceError::Integrity(_) => "IntegrityError",
            ServiceError::Load(LoadError::Integrity(_)) => "IntegrityError",
            ServiceError::Load(_) => "LoadError",
            ServiceError::Engine(_) => "EngineError",
            ServiceError::Session(_) => "SessionError",
            ServiceError::Feature(FeatureError::NotRegistered(_)) => "NotRegisteredError",
            ServiceError::Feature(_) => "FeatureError",
            ServiceError::Bridge(BridgeError::ReadOnlyField(_)) => "ReadOnlyFieldError",
            ServiceError::Bridge(_) => "BridgeError",
            ServiceError::Run(RunError::Integrity(_)) => "IntegrityError",
            ServiceError::Run(RunError::Load(_)) => "LoadError",
            ServiceError::Run(RunError::Plugin { .. }) => "PluginError",
            ServiceError::Run(RunError::Cancelled(_)) => "Cancelled",
            ServiceError::Run(_) => "RunError",
            ServiceError::Fetch(FetchError::FeatureAbsent { .. }) => "NotRegisteredError",
            ServiceError::Fetch(_) => "FetchError",
            ServiceError::Install(InstallError::Integrity(_)) => "IntegrityError",
            ServiceError::Install(_) => "InstallError",
            ServiceError::Repository(_) => "RepositoryError",
            ServiceError::Cache(_) => "CacheError",
            ServiceError::NotFound(_) => "NotFound",
            ServiceError::InvalidRequest(_) => "InvalidRequest",
            ServiceError::Io(_) => "IoError",
        }
    }

    /// Only network-caused load failures are worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Load(e) => e.is_retryable(),
            ServiceError::Run(e) => e.is_retryable(),
            ServiceError::Install(InstallError::Load(e)) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Error payload printed by the CLI
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub trace_id: String,
}

impl ErrorResponse {
    pub fn from_error(error: &ServiceError) -> Self {
        Self {
            error: error.error_type().to_string(),
            message: error.to_string(),
            retryable: error.is_retryable(),
            details: None,
            trace_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
