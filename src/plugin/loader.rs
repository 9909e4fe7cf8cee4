//! Plugin code loading
//!
//! Resolves an entry script locator, reads its bytes under a size ceiling,
//! and hands back decoded source only after every checksum matched.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use super::checksum::{Checksums, IntegrityError};
use crate::cache::ResponseCache;

/// Default ceiling for a single entry script
pub const MAX_SOURCE_BYTES: u64 = 1024 * 1024;

/// Scheme prefix for files under the bundled assets root
pub const ASSET_SCHEME: &str = "asset://";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Unsupported locator: {0}")]
    UnsupportedLocator(String),

    #[error("Source too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("Source not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Source is not valid UTF-8")]
    InvalidUtf8,

    #[error("Integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),
}

impl LoadError {
    /// Only transport-level failures are worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            LoadError::Network(_) => true,
            LoadError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for LoadError {
    fn from(e: reqwest::Error) -> Self {
        LoadError::Network(e.to_string())
    }
}

/// A resolved source location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// Path relative to the bundled assets root
    Asset(PathBuf),
    /// Local file
    File(PathBuf),
    /// Remote http(s) resource
    Remote(Url),
}

impl Locator {
    /// Parse a locator string.
    ///
    /// Resolution order: `asset://`, absolute path, `file://`, `http(s)://`.
    pub fn parse(locator: &str) -> Result<Self, LoadError> {
        let unsupported = || LoadError::UnsupportedLocator(locator.to_string());

        if let Some(relative) = locator.strip_prefix(ASSET_SCHEME) {
            let path = PathBuf::from(relative);
            let contained = path.components().next().is_some()
                && path.components().all(|c| matches!(c, Component::Normal(_)));
            if !contained {
                return Err(unsupported());
            }
            return Ok(Locator::Asset(path));
        }

        if Path::new(locator).is_absolute() {
            return Ok(Locator::File(PathBuf::from(locator)));
        }

        let lowered = locator.to_ascii_lowercase();
        if lowered.starts_with("file://") {
            let url = Url::parse(locator).map_err(|_| unsupported())?;
            let path = url.to_file_path().map_err(|_| unsupported())?;
            return Ok(Locator::File(path));
        }

        if lowered.starts_with("http://") || lowered.starts_with("https://") {
            let url = Url::parse(locator).map_err(|_| unsupported())?;
            return Ok(Locator::Remote(url));
        }

        Err(unsupported())
    }
}

/// Options for building a [`CodeLoader`]
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub assets_dir: PathBuf,
    pub max_bytes: u64,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            assets_dir: PathBuf::from("./assets"),
            max_bytes: MAX_SOURCE_BYTES,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: concat!("service-runtime/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Where fetched bytes came from
enum Origin {
    Disk,
    Cache(Url),
    Network(Url),
}

/// Fetches and verifies plugin code
#[derive(Debug, Clone)]
pub struct CodeLoader {
    assets_dir: PathBuf,
    max_bytes: u64,
    client: reqwest::Client,
    cache: Option<ResponseCache>,
}

impl CodeLoader {
    pub fn new(options: LoaderOptions, cache: Option<ResponseCache>) -> Result<Self, LoadError> {
        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .connect_timeout(options.connect_timeout)
            .user_agent(options.user_agent)
            .build()?;

        Ok(Self {
            assets_dir: options.assets_dir,
            max_bytes: options.max_bytes,
            client,
            cache,
        })
    }

    pub fn assets_dir(&self) -> &Path {
        &self.assets_dir
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Load an entry script and verify it against `checksums`.
    ///
    /// The decoded text is only returned when every digest matches. Remote
    /// code enters the response cache only after it verified; a cached copy
    /// that no longer matches is dropped and fetched again.
    pub async fn load(&self, checksums: &Checksums, locator: &str) -> Result<String, LoadError> {
        let (bytes, origin) = self.fetch(locator).await?;

        let source = match (Self::verify(checksums, locator, bytes), origin) {
            (Ok(source), Origin::Network(url)) => {
                self.store(&url, source.as_bytes()).await;
                source
            }
            (Ok(source), _) => source,
            (Err(LoadError::Integrity(_)), Origin::Cache(url)) => {
                self.evict(&url).await;
                let bytes = self.fetch_network(url.clone()).await?;
                let source = Self::verify(checksums, locator, bytes)?;
                self.store(&url, source.as_bytes()).await;
                source
            }
            (Err(e), _) => return Err(e),
        };

        info!(locator, size = source.len(), "Loaded plugin code");
        Ok(source)
    }

    fn verify(checksums: &Checksums, locator: &str, bytes: Vec<u8>) -> Result<String, LoadError> {
        let source = String::from_utf8(bytes).map_err(|_| LoadError::InvalidUtf8)?;

        if let Err(e) = checksums.verify(source.as_bytes()) {
            warn!(locator, mismatched = %e, "Rejected plugin code");
            return Err(LoadError::Integrity(e));
        }
        Ok(source)
    }

    /// Read the raw bytes behind `locator`, bounded by the size ceiling
    pub async fn fetch_bytes(&self, locator: &str) -> Result<Vec<u8>, LoadError> {
        self.fetch(locator).await.map(|(bytes, _)| bytes)
    }

    async fn fetch(&self, locator: &str) -> Result<(Vec<u8>, Origin), LoadError> {
        match Locator::parse(locator)? {
            Locator::Asset(relative) => {
                let path = self.assets_dir.join(relative);
                Ok((self.read_file(&path, locator).await?, Origin::Disk))
            }
            Locator::File(path) => Ok((self.read_file(&path, locator).await?, Origin::Disk)),
            Locator::Remote(url) => {
                if let Some(bytes) = self.cached(&url).await? {
                    return Ok((bytes, Origin::Cache(url)));
                }
                let bytes = self.fetch_network(url.clone()).await?;
                Ok((bytes, Origin::Network(url)))
            }
        }
    }

    async fn read_file(&self, path: &Path, locator: &str) -> Result<Vec<u8>, LoadError> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(LoadError::NotFound(locator.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        self.check_size(metadata.len())?;

        let bytes = tokio::fs::read(path).await?;
        // The file may have grown since the metadata call
        self.check_size(bytes.len() as u64)?;

        debug!(locator, size = bytes.len(), "Read plugin code from disk");
        Ok(bytes)
    }

    async fn cached(&self, url: &Url) -> Result<Option<Vec<u8>>, LoadError> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };
        match cache.get(url.as_str()).await {
            Ok(Some(bytes)) => {
                self.check_size(bytes.len() as u64)?;
                Ok(Some(bytes))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(url = %url, "Response cache read failed: {}", e);
                Ok(None)
            }
        }
    }

    async fn store(&self, url: &Url, bytes: &[u8]) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(url.as_str(), bytes).await {
                warn!(url = %url, "Response cache write failed: {}", e);
            }
        }
    }

    async fn evict(&self, url: &Url) {
        if let Some(cache) = &self.cache {
            debug!(url = %url, "Cached plugin code failed verification, refetching");
            if let Err(e) = cache.remove(url.as_str()).await {
                warn!(url = %url, "Response cache eviction failed: {}", e);
            }
        }
    }

    async fn fetch_network(&self, url: Url) -> Result<Vec<u8>, LoadError> {
        let mut resp = self.client.get(url.clone()).send().await?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(LoadError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(LoadError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        if let Some(length) = resp.content_length() {
            self.check_size(length)?;
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            self.check_size((bytes.len() + chunk.len()) as u64)?;
            bytes.extend_from_slice(&chunk);
        }

        debug!(url = %url, size = bytes.len(), "Fetched plugin code");
        Ok(bytes)
    }

    fn check_size(&self, size: u64) -> Result<(), LoadError> {
        if size > self.max_bytes {
            return Err(LoadError::TooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }
}
