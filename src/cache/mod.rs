//! Response cache module
//!
//! Disk cache for remote plugin code. Entries are addressed by the SHA-256 of
//! the request identity, so concurrent sessions fetching the same URL read and
//! write the same file. Writes go to a temporary file first and are renamed
//! into place; the last writer wins.

use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Cache entry too large: {size} bytes (budget {budget})")]
    TooLarge { size: u64, budget: u64 },
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Information about a cached response
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub size: u64,
    pub path: PathBuf,
    pub modified_at: Option<SystemTime>,
}

/// Cache for remote GET responses, bounded by a byte budget
#[derive(Debug, Clone)]
pub struct ResponseCache {
    cache_dir: PathBuf,
    max_bytes: u64,
    ttl: Option<Duration>,
}

impl ResponseCache {
    /// Create a cache rooted at `cache_dir`, creating the directory if needed
    pub fn new(cache_dir: PathBuf, max_bytes: u64, ttl: Option<Duration>) -> Result<Self> {
        if !cache_dir.exists() {
            fs::create_dir_all(&cache_dir)?;
        }

        Ok(Self {
            cache_dir,
            max_bytes,
            ttl,
        })
    }

    /// Cache key of a GET request for `url`
    pub fn key_for(url: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"GET ");
        hasher.update(url.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.cache", key))
    }

    /// Read a cached response body, if a fresh entry exists
    pub async fn get(&self, url: &str) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(&Self::key_for(url));

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if let (Some(ttl), Ok(modified)) = (self.ttl, metadata.modified()) {
            let age = SystemTime::now()
                .duration_since(modified)
                .unwrap_or_default();
            if age > ttl {
                tracing::debug!(url, "Cached response expired");
                return Ok(None);
            }
        }

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            // Evicted between the metadata call and the read
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Store a response body, then evict old entries over the byte budget
    pub async fn put(&self, url: &str, body: &[u8]) -> Result<CacheEntry> {
        let size = body.len() as u64;
        if size > self.max_bytes {
            return Err(CacheError::TooLarge {
                size,
                budget: self.max_bytes,
            });
        }

        let key = Self::key_for(url);
        let path = self.entry_path(&key);
        let temp_path = self
            .cache_dir
            .join(format!("{}.{}.tmp", key, uuid::Uuid::new_v4().simple()));

        tokio::fs::write(&temp_path, body).await?;
        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        tracing::debug!(url, key = %key, size, "Cached response");

        if let Err(e) = self.enforce_limits(self.max_bytes).await {
            tracing::warn!("Failed to enforce cache limits: {}", e);
        }

        Ok(CacheEntry {
            key,
            size,
            path,
            modified_at: Some(SystemTime::now()),
        })
    }

    /// Drop the entry for `url`. Returns whether one existed.
    pub async fn remove(&self, url: &str) -> Result<bool> {
        let path = self.entry_path(&Self::key_for(url));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(url, "Removed cached response");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// List all cache entries
    pub async fn list_entries(&self) -> Result<Vec<CacheEntry>> {
        let mut cached = Vec::new();

        let mut entries = tokio::fs::read_dir(&self.cache_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();

            if path.extension().and_then(|s| s.to_str()) != Some("cache") {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };

            // Entries can disappear under a concurrent eviction
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };

            cached.push(CacheEntry {
                key,
                size: metadata.len(),
                path,
                modified_at: metadata.modified().ok(),
            });
        }

        Ok(cached)
    }

    /// Total bytes currently held
    pub async fn total_size(&self) -> Result<u64> {
        Ok(self.list_entries().await?.iter().map(|e| e.size).sum())
    }

    /// Remove every entry, returning how many were deleted
    pub async fn clear_all(&self) -> Result<usize> {
        let mut count = 0;
        for entry in self.list_entries().await? {
            match tokio::fs::remove_file(&entry.path).await {
                Ok(()) => count += 1,
                Err(e) => tracing::warn!("Failed to delete file {}: {}", entry.path.display(), e),
            }
        }
        Ok(count)
    }

    /// Enforce the byte budget, removing oldest entries first
    pub async fn enforce_limits(&self, max_bytes: u64) -> Result<usize> {
        let mut cached = self.list_entries().await?;

        let mut current_size: u64 = cached.iter().map(|e| e.size).sum();
        if current_size <= max_bytes {
            return Ok(0);
        }

        cached.sort_by(|a, b| a.modified_at.cmp(&b.modified_at));

        tracing::info!(
            "Cache budget exceeded ({}/{} bytes). Starting cleanup...",
            current_size,
            max_bytes
        );

        let mut removed = 0;
        for entry in cached {
            if current_size <= max_bytes {
                break;
            }

            if let Err(e) = tokio::fs::remove_file(&entry.path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("Failed to delete cache file {}: {}", entry.path.display(), e);
                    continue;
                }
            }

            current_size = current_size.saturating_sub(entry.size);
            removed += 1;

            tracing::debug!("Removed old cache entry: {} (Size: {})", entry.key, entry.size);
        }

        tracing::info!("Cache cleanup complete. Removed {} entries.", removed);
        Ok(removed)
    }
}
