//! Manifest persistence
//!
//! Stores installed service manifests (configs travel inside them) and adapts
//! a store into the bridge updater traits.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::bridge::{ConfigUpdater, ManifestUpdater};
use super::types::{ServiceConfig, ServiceManifest};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid service id: {0:?}")]
    InvalidId(String),
}

/// Store of installed service manifests
#[async_trait]
pub trait ManifestRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<ServiceManifest>, RepositoryError>;

    /// Insert or replace by id
    async fn upsert(&self, manifest: &ServiceManifest) -> Result<(), RepositoryError>;

    /// All manifests, sorted by id
    async fn list(&self) -> Result<Vec<ServiceManifest>, RepositoryError>;

    /// Remove by id, reporting whether anything was stored
    async fn remove(&self, id: &str) -> Result<bool, RepositoryError>;

    /// Installed manifest sharing the given stable id
    async fn find_by_original_id(&self, original_id: &str) -> Result<Option<ServiceManifest>, RepositoryError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|m| m.stable_id() == original_id))
    }
}

/// In-memory repository
#[derive(Debug, Default)]
pub struct MemoryManifestRepository {
    manifests: RwLock<HashMap<String, ServiceManifest>>,
}

impl MemoryManifestRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ManifestRepository for MemoryManifestRepository {
    async fn get(&self, id: &str) -> Result<Option<ServiceManifest>, RepositoryError> {
        Ok(self.manifests.read().await.get(id).cloned())
    }

    async fn upsert(&self, manifest: &ServiceManifest) -> Result<(), RepositoryError> {
        self.manifests
            .write()
            .await
            .insert(manifest.id.clone(), manifest.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ServiceManifest>, RepositoryError> {
        let mut manifests: Vec<ServiceManifest> = self.manifests.read().await.values().cloned().collect();
        manifests.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(manifests)
    }

    async fn remove(&self, id: &str) -> Result<bool, RepositoryError> {
        Ok(self.manifests.write().await.remove(id).is_some())
    }
}

/// One JSON file per service under a directory
#[derive(Debug, Clone)]
pub struct JsonManifestRepository {
    dir: PathBuf,
}

impl JsonManifestRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, RepositoryError> {
        let valid = !id.is_empty()
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(RepositoryError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }
}

#[async_trait]
impl ManifestRepository for JsonManifestRepository {
    async fn get(&self, id: &str) -> Result<Option<ServiceManifest>, RepositoryError> {
        let path = self.path_for(id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn upsert(&self, manifest: &ServiceManifest) -> Result<(), RepositoryError> {
        let path = self.path_for(&manifest.id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let json = serde_json::to_vec_pretty(manifest)?;
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", manifest.id, uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(service = %manifest.id, path = %path.display(), "Stored manifest");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ServiceManifest>, RepositoryError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut manifests = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_manifest = path.extension().map_or(false, |ext| ext == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_manifest {
                continue;
            }

            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<ServiceManifest>(&bytes) {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => warn!(path = %path.display(), "Skipping unreadable manifest: {}", e),
            }
        }

        manifests.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(manifests)
    }

    async fn remove(&self, id: &str) -> Result<bool, RepositoryError> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Persists bridge updates into a repository.
///
/// Updates are accepted synchronously (they arrive from inside guest calls)
/// and written in order by a background task. Config updates are folded into
/// the last known manifest before being stored.
pub struct RepositoryUpdater {
    current: Mutex<ServiceManifest>,
    tx: mpsc::UnboundedSender<ServiceManifest>,
}

impl RepositoryUpdater {
    /// Create an updater and its writer task.
    ///
    /// The task finishes once every handle to the updater is dropped and all
    /// queued writes are stored.
    pub fn spawn(repository: Arc<dyn ManifestRepository>, manifest: ServiceManifest) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<ServiceManifest>();

        let handle = tokio::spawn(async move {
            while let Some(manifest) = rx.recv().await {
                if let Err(e) = repository.upsert(&manifest).await {
                    error!(service = %manifest.id, "Failed to persist manifest update: {}", e);
                }
            }
        });

        let updater = Arc::new(Self {
            current: Mutex::new(manifest),
            tx,
        });
        (updater, handle)
    }

    fn store(&self, manifest: ServiceManifest) {
        if self.tx.send(manifest).is_err() {
            warn!("Manifest writer stopped, dropping update");
        }
    }
}

impl ManifestUpdater for RepositoryUpdater {
    fn update(&self, manifest: &ServiceManifest) {
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        *current = manifest.clone();
        self.store(current.clone());
    }
}

impl ConfigUpdater for RepositoryUpdater {
    fn update(&self, configs: &[ServiceConfig]) {
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        current.configs = Some(configs.to_vec());
        self.store(current.clone());
    }
}
