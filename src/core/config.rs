//! Configuration management

use clap::{Parser, Subcommand};
use config::{Config as ConfigBuilder, ConfigError as BuilderError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::plugin::engine::DEFAULT_ENGINE;
use crate::plugin::host::HttpOptions;
use crate::plugin::loader::{LoaderOptions, MAX_SOURCE_BYTES};

/// Prefix of environment overrides, e.g. `SERVICE_RUNTIME_RUNTIME__ENGINE=boa`
pub const ENV_PREFIX: &str = "SERVICE_RUNTIME";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid runtime configuration: {0}")]
    InvalidRuntime(String),

    #[error("Invalid cache configuration: {0}")]
    InvalidCache(String),

    #[error("Invalid HTTP configuration: {0}")]
    InvalidHttp(String),

    #[error("Invalid storage configuration: {0}")]
    InvalidStorage(String),

    #[error("Invalid logging configuration: {0}")]
    InvalidLogging(String),

    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

impl From<BuilderError> for ConfigError {
    fn from(err: BuilderError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub cache: CacheConfig,
    pub http: HttpConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

fn with_defaults(
    builder: config::builder::ConfigBuilder<config::builder::DefaultState>,
) -> Result<config::builder::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
    let data_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("service-runtime");
    let cache_dir = dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("service-runtime");

    Ok(builder
        .set_default("runtime.engine", DEFAULT_ENGINE)?
        .set_default("runtime.assets_dir", "./assets")?
        .set_default("runtime.max_source_bytes", MAX_SOURCE_BYTES)?
        .set_default("runtime.call_timeout", 60)?
        .set_default("cache.enabled", true)?
        .set_default("cache.dir", cache_dir.join("responses").display().to_string())?
        .set_default("cache.max_bytes", 52428800u64)? // 50 MB
        .set_default("cache.ttl", 86400)?
        .set_default("http.timeout", 30)?
        .set_default("http.connect_timeout", 10)?
        .set_default("http.user_agent", concat!("service-runtime/", env!("CARGO_PKG_VERSION")))?
        .set_default("http.max_response_bytes", 16777216u64)? // 16 MB
        .set_default("storage.manifests_dir", data_dir.join("manifests").display().to_string())?
        .set_default("logging.level", "info")?
        .set_default("logging.format", "text")?
        .set_default("logging.output", "stderr")?
        .set_default("logging.rotation", "daily")?)
}

impl Config {
    /// Load configuration with precedence: CLI args > Environment variables > Config file > Defaults
    pub fn load(cli_args: &CliArgs) -> Result<Self, ConfigError> {
        let mut builder = with_defaults(ConfigBuilder::builder())?;

        if let Some(config_path) = &cli_args.config {
            if !config_path.exists() {
                return Err(ConfigError::FileNotFound(config_path.display().to_string()));
            }
            builder = builder.add_source(File::from(config_path.as_path()));
        }

        // Example: SERVICE_RUNTIME_CACHE__MAX_BYTES=1048576
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        if let Some(engine) = &cli_args.engine {
            builder = builder.set_override("runtime.engine", engine.clone())?;
        }
        if let Some(assets_dir) = &cli_args.assets_dir {
            builder = builder.set_override("runtime.assets_dir", assets_dir.display().to_string())?;
        }
        if let Some(manifests_dir) = &cli_args.manifests_dir {
            builder = builder.set_override("storage.manifests_dir", manifests_dir.display().to_string())?;
        }
        if cli_args.no_cache {
            builder = builder.set_override("cache.enabled", false)?;
        }
        if let Some(log_level) = &cli_args.log_level {
            builder = builder.set_override("logging.level", log_level.clone())?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path on top of the defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let config: Config = with_defaults(ConfigBuilder::builder())?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Defaults only
    pub fn defaults() -> Result<Self, ConfigError> {
        let config: Config = with_defaults(ConfigBuilder::builder())?.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.runtime.validate()?;
        self.cache.validate()?;
        self.http.validate()?;
        self.storage.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Options for the code loader
    pub fn loader_options(&self) -> LoaderOptions {
        LoaderOptions {
            assets_dir: self.runtime.assets_dir.clone(),
            max_bytes: self.runtime.max_source_bytes,
            timeout: Duration::from_secs(self.http.timeout),
            connect_timeout: Duration::from_secs(self.http.connect_timeout),
            user_agent: self.http.user_agent.clone(),
        }
    }

    /// Options for guest HTTP requests
    pub fn http_options(&self) -> HttpOptions {
        HttpOptions {
            timeout: Duration::from_secs(self.http.timeout),
            connect_timeout: Duration::from_secs(self.http.connect_timeout),
            user_agent: self.http.user_agent.clone(),
            max_response_bytes: self.http.max_response_bytes,
        }
    }
}

/// Command-line arguments
#[derive(Debug, Parser)]
#[command(name = "service-runtime")]
#[command(about = "Run sandboxed content service plugins", long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Script engine backend (v8, boa)
    #[arg(short, long, value_name = "NAME", global = true)]
    pub engine: Option<String>,

    /// Root of bundled assets (`asset://` locators)
    #[arg(long, value_name = "DIR", global = true)]
    pub assets_dir: Option<PathBuf>,

    /// Directory holding installed manifests
    #[arg(long, value_name = "DIR", global = true)]
    pub manifests_dir: Option<PathBuf>,

    /// Bypass the response cache
    #[arg(long, global = true)]
    pub no_cache: bool,

    /// Log level (debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the checksum set of a file
    Checksum { file: PathBuf },

    /// Install a service from a manifest locator
    Install { locator: String },

    /// List installed services
    List,

    /// List bundled services under the assets root
    Discover {
        /// Install every discovered service
        #[arg(long)]
        install: bool,
    },

    /// Fetch the latest posts
    Latest {
        id: String,
        #[arg(long)]
        key: Option<String>,
    },

    /// Fetch a single post
    Post { id: String, post_id: String },

    /// Fetch comments of a post
    Comments {
        id: String,
        post_id: String,
        #[arg(long)]
        key: Option<String>,
    },

    /// Search posts
    Search {
        id: String,
        query: String,
        #[arg(long)]
        key: Option<String>,
    },

    /// Fetch a user by id, or by profile URL with --url
    User {
        id: String,
        user: String,
        #[arg(long)]
        url: bool,
    },

    /// Fetch posts of a user
    UserPosts {
        id: String,
        user_id: String,
        #[arg(long)]
        key: Option<String>,
    },

    /// Validate the stored configs of a service
    Validate {
        id: String,
        /// Also run the service's own validator
        #[arg(long)]
        plugin: bool,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    pub engine: String,
    pub assets_dir: PathBuf,
    pub max_source_bytes: u64, // bytes
    pub call_timeout: u64,     // seconds, 0 disables
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.trim().is_empty() {
            return Err(ConfigError::InvalidRuntime("engine cannot be empty".to_string()));
        }

        if self.assets_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidRuntime("assets_dir cannot be empty".to_string()));
        }

        if self.max_source_bytes == 0 {
            return Err(ConfigError::InvalidRuntime("max_source_bytes must be greater than 0".to_string()));
        }

        Ok(())
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout > 0).then(|| Duration::from_secs(self.call_timeout))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    pub max_bytes: u64, // bytes
    pub ttl: u64,       // seconds, 0 keeps entries until evicted
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidCache("dir cannot be empty".to_string()));
        }

        if self.enabled && self.max_bytes == 0 {
            return Err(ConfigError::InvalidCache("max_bytes must be greater than 0".to_string()));
        }

        Ok(())
    }

    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl > 0).then(|| Duration::from_secs(self.ttl))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub timeout: u64,         // seconds
    pub connect_timeout: u64, // seconds
    pub user_agent: String,
    pub max_response_bytes: u64,
}

impl HttpConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout == 0 {
            return Err(ConfigError::InvalidHttp("timeout must be greater than 0".to_string()));
        }

        if self.connect_timeout == 0 {
            return Err(ConfigError::InvalidHttp("connect_timeout must be greater than 0".to_string()));
        }

        if self.user_agent.trim().is_empty() {
            return Err(ConfigError::InvalidHttp("user_agent cannot be empty".to_string()));
        }

        if self.max_response_bytes == 0 {
            return Err(ConfigError::InvalidHttp("max_response_bytes must be greater than 0".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub manifests_dir: PathBuf,
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.manifests_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidStorage("manifests_dir cannot be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub log_file: Option<PathBuf>,
    pub rotation: String,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "level must be one of: {:?}",
                valid_levels
            )));
        }

        let valid_formats = ["json", "text"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "format must be one of: {:?}",
                valid_formats
            )));
        }

        let valid_outputs = ["stdout", "stderr", "file"];
        if !valid_outputs.contains(&self.output.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "output must be one of: {:?}",
                valid_outputs
            )));
        }

        if self.output == "file" && self.log_file.is_none() {
            return Err(ConfigError::InvalidLogging(
                "log_file must be specified when output is 'file'".to_string(),
            ));
        }

        let valid_rotations = ["never", "hourly", "daily"];
        if !valid_rotations.contains(&self.rotation.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "rotation must be one of: {:?}",
                valid_rotations
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::defaults().unwrap();
        assert_eq!(config.runtime.engine, "v8");
        assert_eq!(config.runtime.max_source_bytes, 1024 * 1024);
        assert_eq!(config.cache.max_bytes, 50 * 1024 * 1024);
        assert_eq!(config.runtime.call_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[runtime]\nengine = \"boa\"\ncall_timeout = 0\n\n[cache]\nttl = 0\n"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.runtime.engine, "boa");
        assert_eq!(config.runtime.call_timeout(), None);
        assert_eq!(config.cache.ttl(), None);
        assert_eq!(config.http.timeout, 30);
    }

    #[test]
    fn test_cli_overrides_everything() {
        let args = CliArgs::parse_from([
            "service-runtime",
            "--engine",
            "boa",
            "--no-cache",
            "--log-level",
            "debug",
            "list",
        ]);
        let config = Config::load(&args).unwrap();
        assert_eq!(config.runtime.engine, "boa");
        assert!(!config.cache.enabled);
        assert_eq!(config.logging.level, "debug");
        assert!(matches!(args.command, Command::List));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::from_file(Path::new("/nonexistent/runtime.toml")),
            Err(ConfigError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_logging_validation() {
        let mut logging = Config::defaults().unwrap().logging;
        logging.output = "file".to_string();
        assert!(logging.validate().is_err());

        logging.log_file = Some(PathBuf::from("/tmp/runtime.log"));
        assert!(logging.validate().is_ok());

        logging.rotation = "weekly".to_string();
        assert!(logging.validate().is_err());
    }
}
