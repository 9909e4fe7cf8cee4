//! Service plugin runtime
//!
//! This module provides everything needed to run untrusted service plugins:
//! - Checksum verification and code loading (asset, file, remote)
//! - Script engine backends behind one [`engine::Engine`] trait
//! - Manifest/config bridges and the per-session feature registry
//! - The staged service runner and typed fetch operations
//! - Config validation, manifest storage and installation

pub mod bridge;
pub mod checksum;
pub mod engine;
pub mod features;
pub mod host;
pub mod installer;
pub mod loader;
pub mod operations;
pub mod repository;
pub mod runner;
pub mod session;
pub mod types;
pub mod validator;

pub use bridge::{BridgeError, ConfigBridge, ConfigUpdater, ManifestBridge, ManifestUpdater, NoopUpdater};
pub use checksum::{Algorithm, Checksums, IntegrityError};
pub use engine::{Binding, Engine, EngineError, EngineFactory, EngineRegistry, HostError};
pub use features::{Capability, Feature, FeatureError, FeatureRegistry};
pub use host::HttpOptions;
pub use installer::{discover_bundled, InstallError, InstallOutcome, ServiceInstaller};
pub use loader::{CodeLoader, LoadError, LoaderOptions, Locator};
pub use operations::{ConfigFailure, FetchError, FetchOutcome};
pub use repository::{JsonManifestRepository, ManifestRepository, MemoryManifestRepository, RepositoryError, RepositoryUpdater};
pub use runner::{RunError, RunStage, ServiceRunner};
pub use session::{ServiceSession, SessionError};
pub use types::{
    Comment, ConfigKind, ConfigOption, Media, PageCursor, PageKey, PagedResult, Post, ServiceConfig,
    ServiceManifest, ServiceSource, User, ValidationResult, HOST_API_VERSION,
};
pub use validator::{validate_structure, ConfigValidator};
