//! Service Runtime Library
//!
//! Loads, verifies and runs sandboxed JavaScript service plugins that fetch
//! posts, comments and users from external content sources.

pub mod cache;
pub mod core;
pub mod plugin;

// Re-export commonly used types
pub use crate::core::{Config, ServiceError};
pub use plugin::{EngineRegistry, FetchOutcome, ServiceRunner, ServiceSession};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
