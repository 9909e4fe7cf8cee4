//! Service runner
//!
//! Drives one execution of a service through
//! `Created -> CodeLoaded -> BindingsInstalled -> EntryEvaluated -> Ready -> Disposed`.
//! Code is loaded and verified before any engine exists; once a session
//! worker has been spawned it is disposed on every exit path, including
//! cancellation and a dropped `run` future.

use serde_json::{json, Value};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bridge::{ConfigBridge, ConfigUpdater, ManifestBridge, ManifestUpdater};
use super::checksum::IntegrityError;
use super::engine::{Binding, EngineError, EngineRegistry, HostError, PRELUDE};
use super::features::{Capability, FeatureError, FeatureRegistry};
use super::host::{self, HttpOptions};
use super::loader::{CodeLoader, LoadError};
use super::session::{ServiceSession, SessionError, SessionWorker};
use super::types::{ServiceConfig, ServiceManifest, HOST_API_VERSION};

/// Lifecycle stage of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Created,
    CodeLoaded,
    BindingsInstalled,
    EntryEvaluated,
    Ready,
    Disposed,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Created => "created",
            RunStage::CodeLoaded => "code_loaded",
            RunStage::BindingsInstalled => "bindings_installed",
            RunStage::EntryEvaluated => "entry_evaluated",
            RunStage::Ready => "ready",
            RunStage::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Service '{id}' supports host API {min}..={}, host provides {host}", .max.map(|m| m.to_string()).unwrap_or_else(|| "*".to_string()))]
    Incompatible {
        id: String,
        min: u32,
        max: Option<u32>,
        host: u32,
    },

    #[error("Service code rejected: {0}")]
    Integrity(IntegrityError),

    #[error("Failed to load service code: {0}")]
    Load(LoadError),

    #[error("Engine error: {0}")]
    Engine(EngineError),

    #[error("Service entry script failed ({name}): {message}")]
    Plugin { name: String, message: String },

    #[error("Run cancelled at stage {0}")]
    Cancelled(RunStage),

    #[error("Session error: {0}")]
    Session(SessionError),
}

impl RunError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RunError::Load(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<LoadError> for RunError {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::Integrity(e) => RunError::Integrity(e),
            other => RunError::Load(other),
        }
    }
}

impl From<SessionError> for RunError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Engine(e) => RunError::Engine(e),
            other => RunError::Session(other),
        }
    }
}

/// Config updater that also keeps the manifest bridge's copy current
struct SyncedConfigUpdater {
    inner: Arc<dyn ConfigUpdater>,
    manifest: Arc<ManifestBridge>,
}

impl ConfigUpdater for SyncedConfigUpdater {
    fn update(&self, configs: &[ServiceConfig]) {
        self.inner.update(configs);
        self.manifest.refresh_configs(configs);
    }
}

fn string_arg(args: &Value, index: usize, what: &str) -> Result<String, HostError> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| HostError::type_error(format!("{} must be a string", what)))
}

fn manifest_set_binding(bridge: Arc<ManifestBridge>) -> Binding {
    Binding::function(move |args| {
        let field = string_arg(&args, 0, "manifest field")?;
        let value = args.get(1).cloned().unwrap_or(Value::Null);
        bridge
            .set_field(&field, value)
            .map_err(|e| HostError::new(e.guest_name(), e.to_string()))
    })
}

fn config_set_binding(bridge: Arc<ConfigBridge>) -> Binding {
    Binding::function(move |args| {
        let key = string_arg(&args, 0, "config key")?;
        let value = args.get(1).cloned().unwrap_or(Value::Null);
        let snapshot = bridge.set_json(&key, value);
        serde_json::to_value(snapshot).map_err(|e| HostError::new("InternalError", e.to_string()))
    })
}

fn feature_register_binding(features: Arc<Mutex<FeatureRegistry>>) -> Binding {
    Binding::function(move |args| {
        let capability = Capability::from_tag(&string_arg(&args, 0, "capability")?);
        let class_name = string_arg(&args, 1, "class name")?;

        let mut registry = features
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry
            .register_guest(capability.clone(), &class_name)
            .map_err(|e| match e {
                FeatureError::Reserved(_) => HostError::new("ReservedFeature", e.to_string()),
                other => HostError::new("FeatureError", other.to_string()),
            })?;
        Ok(json!(capability.tag()))
    })
}

/// Runs services against a loader and an engine registry
#[derive(Clone)]
pub struct ServiceRunner {
    loader: Arc<CodeLoader>,
    engines: Arc<EngineRegistry>,
    engine: Option<String>,
    http: HttpOptions,
    call_timeout: Option<Duration>,
    api_version: u32,
}

impl ServiceRunner {
    pub fn new(loader: Arc<CodeLoader>, engines: Arc<EngineRegistry>) -> Self {
        Self {
            loader,
            engines,
            engine: None,
            http: HttpOptions::default(),
            call_timeout: None,
            api_version: HOST_API_VERSION,
        }
    }

    /// Use a specific backend instead of the registry default
    pub fn with_engine(mut self, name: impl Into<String>) -> Self {
        self.engine = Some(name.into());
        self
    }

    pub fn with_http_options(mut self, http: HttpOptions) -> Self {
        self.http = http;
        self
    }

    /// Limit how long a single guest call may take
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn loader(&self) -> &Arc<CodeLoader> {
        &self.loader
    }

    pub fn engines(&self) -> &Arc<EngineRegistry> {
        &self.engines
    }

    /// Run `body` against a ready session of `manifest`
    pub async fn run<T, F, Fut>(
        &self,
        manifest: ServiceManifest,
        manifest_updater: Arc<dyn ManifestUpdater>,
        config_updater: Arc<dyn ConfigUpdater>,
        body: F,
    ) -> Result<T, RunError>
    where
        F: FnOnce(ServiceSession) -> Fut,
        Fut: Future<Output = T>,
    {
        self.run_with_cancel(
            manifest,
            manifest_updater,
            config_updater,
            CancellationToken::new(),
            body,
        )
        .await
    }

    /// [`ServiceRunner::run`] with caller-driven cancellation.
    ///
    /// Cancellation is honoured between stages. A guest call already in
    /// progress runs to completion; the session is disposed afterwards.
    pub async fn run_with_cancel<T, F, Fut>(
        &self,
        manifest: ServiceManifest,
        manifest_updater: Arc<dyn ManifestUpdater>,
        config_updater: Arc<dyn ConfigUpdater>,
        cancel: CancellationToken,
        body: F,
    ) -> Result<T, RunError>
    where
        F: FnOnce(ServiceSession) -> Fut,
        Fut: Future<Output = T>,
    {
        let service_id = manifest.id.clone();
        let mut stage = RunStage::Created;
        debug!(service = %service_id, stage = %stage, "Starting service run");

        if !manifest.supports_api(self.api_version) {
            warn!(
                service = %service_id,
                min = manifest.min_api_version,
                max = ?manifest.max_api_version,
                host = self.api_version,
                "Service is not compatible with this host"
            );
            return Err(RunError::Incompatible {
                id: service_id,
                min: manifest.min_api_version,
                max: manifest.max_api_version,
                host: self.api_version,
            });
        }

        let source = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RunError::Cancelled(stage)),
            loaded = self.loader.load(&manifest.main_checksums, &manifest.main) => loaded?,
        };
        stage = RunStage::CodeLoaded;
        debug!(service = %service_id, stage = %stage, "Service code verified");

        let (engine_name, factory) = self
            .engines
            .factory(self.engine.as_deref())
            .map_err(RunError::Engine)?;

        let configs = manifest.configs.clone().unwrap_or_default();
        let manifest_bridge = Arc::new(ManifestBridge::new(manifest, manifest_updater));
        let config_bridge = Arc::new(ConfigBridge::new(
            configs,
            Arc::new(SyncedConfigUpdater {
                inner: config_updater,
                manifest: manifest_bridge.clone(),
            }),
        ));
        manifest_bridge.link_configs(&config_bridge);
        let features = Arc::new(Mutex::new(FeatureRegistry::new()));

        let session_cancel = cancel.child_token();
        // Cancels the worker if this future is dropped mid-run
        let _guard = session_cancel.clone().drop_guard();

        let worker = Arc::new(
            SessionWorker::spawn(&service_id, &engine_name, factory, session_cancel).await?,
        );

        let result = self
            .drive(
                &worker,
                stage,
                source,
                manifest_bridge,
                config_bridge,
                features,
                &cancel,
                body,
            )
            .await;

        worker.dispose().await;
        info!(
            service = %service_id,
            engine = %engine_name,
            stage = %RunStage::Disposed,
            ok = result.is_ok(),
            "Service run finished"
        );

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive<T, F, Fut>(
        &self,
        worker: &Arc<SessionWorker>,
        mut stage: RunStage,
        source: String,
        manifest_bridge: Arc<ManifestBridge>,
        config_bridge: Arc<ConfigBridge>,
        features: Arc<Mutex<FeatureRegistry>>,
        cancel: &CancellationToken,
        body: F,
    ) -> Result<T, RunError>
    where
        F: FnOnce(ServiceSession) -> Fut,
        Fut: Future<Output = T>,
    {
        let manifest = manifest_bridge.snapshot();
        let service_id = manifest.id.clone();

        if cancel.is_cancelled() {
            return Err(RunError::Cancelled(stage));
        }

        let manifest_value =
            serde_json::to_value(&manifest).map_err(|e| RunError::Engine(EngineError::Marshal(e.to_string())))?;
        let configs_value = serde_json::to_value(config_bridge.snapshot())
            .map_err(|e| RunError::Engine(EngineError::Marshal(e.to_string())))?;

        let bindings = vec![
            ("__service_manifest", Binding::Value(manifest_value)),
            ("__service_configs", Binding::Value(configs_value)),
            ("__manifest_set", manifest_set_binding(manifest_bridge.clone())),
            ("__config_set", config_set_binding(config_bridge.clone())),
            ("__feature_register", feature_register_binding(features.clone())),
            ("__http_request", host::http_binding(service_id.clone(), self.http.clone())),
            ("__log", host::log_binding(service_id.clone())),
        ];
        for (name, binding) in bindings {
            worker.install_binding(name, binding).await?;
        }
        worker.execute("<prelude>", PRELUDE.to_string()).await?;

        stage = RunStage::BindingsInstalled;
        debug!(service = %service_id, stage = %stage, "Host bindings installed");

        if cancel.is_cancelled() {
            return Err(RunError::Cancelled(stage));
        }

        match worker.execute("<entry>", source).await {
            Ok(()) => {}
            Err(SessionError::Engine(EngineError::Guest { name, message })) => {
                warn!(service = %service_id, error = %message, "Service entry script threw");
                return Err(RunError::Plugin { name, message });
            }
            Err(other) => return Err(other.into()),
        }

        stage = RunStage::EntryEvaluated;
        debug!(service = %service_id, stage = %stage, "Service entry script evaluated");

        if cancel.is_cancelled() {
            return Err(RunError::Cancelled(stage));
        }

        stage = RunStage::Ready;
        let session = ServiceSession::new(
            worker.clone(),
            features,
            manifest_bridge,
            config_bridge,
            self.call_timeout,
        );
        info!(
            service = %service_id,
            engine = %session.engine_name(),
            stage = %stage,
            capabilities = ?session.capabilities(),
            "Service ready"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RunError::Cancelled(stage)),
            value = body(session) => Ok(value),
        }
    }
}

impl fmt::Debug for ServiceRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRunner")
            .field("engines", &self.engines)
            .field("engine", &self.engine)
            .field("call_timeout", &self.call_timeout)
            .field("api_version", &self.api_version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::bridge::NoopUpdater;
    use crate::plugin::checksum;
    use crate::plugin::loader::LoaderOptions;
    use crate::plugin::types::{ConfigKind, PageKey, ServiceSource};
    use tempfile::TempDir;

    const ENTRY: &str = r#"
class DemoPosts extends PostFeature {
    getLatest(key) {
        const page = key === null ? 1 : key;
        return {
            items: [{ id: `p${page}`, title: `${config.greeting} ${page}` }],
            nextKey: page < 2 ? page + 1 : null,
        };
    }
}
registerFeature(DemoPosts);
"#;

    fn setup(entry: &str) -> (TempDir, ServiceRunner, ServiceManifest) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("main.js"), entry).unwrap();

        let loader = CodeLoader::new(
            LoaderOptions {
                assets_dir: dir.path().to_path_buf(),
                ..Default::default()
            },
            None,
        )
        .unwrap();
        let runner = ServiceRunner::new(Arc::new(loader), Arc::new(EngineRegistry::builtin()));

        let manifest = ServiceManifest {
            id: "demo".into(),
            original_id: None,
            version: "1.0.0".into(),
            min_api_version: 1,
            max_api_version: None,
            name: "Demo".into(),
            description: None,
            icon: None,
            homepage: None,
            author: None,
            main: "asset://main.js".into(),
            main_checksums: checksum::compute(entry.as_bytes()),
            configs: Some(vec![ServiceConfig::new("greeting", ConfigKind::Text).with_value("hello")]),
            force_config_validation: false,
            source: ServiceSource::User,
        };
        (dir, runner, manifest)
    }

    #[tokio::test]
    async fn test_run_reaches_ready_and_fetches() {
        let (_dir, runner, manifest) = setup(ENTRY);

        let page = runner
            .run(manifest, Arc::new(NoopUpdater), Arc::new(NoopUpdater), |session| async move {
                assert!(session.is_registered(&Capability::Post));
                session.fetch_latest(None).await
            })
            .await
            .unwrap()
            .into_result()
            .unwrap();

        assert_eq!(page.items[0].title.as_deref(), Some("hello 1"));
        assert_eq!(page.next_key, Some(PageKey::from(2i64)));
    }

    #[tokio::test]
    async fn test_incompatible_manifest_is_refused_before_loading() {
        let (_dir, runner, mut manifest) = setup(ENTRY);
        manifest.min_api_version = HOST_API_VERSION + 1;
        manifest.main = "ftp://never/loaded.js".into();

        let err = runner
            .run(manifest, Arc::new(NoopUpdater), Arc::new(NoopUpdater), |_| async {})
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Incompatible { .. }));
    }

    #[tokio::test]
    async fn test_integrity_failure_never_starts_session() {
        let (_dir, runner, mut manifest) = setup(ENTRY);
        manifest.main_checksums = checksum::compute(b"something else");

        let mut body_ran = false;
        let err = runner
            .run(manifest, Arc::new(NoopUpdater), Arc::new(NoopUpdater), |_| {
                body_ran = true;
                async {}
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Integrity(_)));
        assert!(!body_ran);
    }

    #[tokio::test]
    async fn test_throwing_entry_is_plugin_error() {
        let entry = "throw new Error('entry exploded');";
        let (_dir, runner, manifest) = setup(entry);

        let err = runner
            .run(manifest, Arc::new(NoopUpdater), Arc::new(NoopUpdater), |_| async {})
            .await
            .unwrap_err();
        match err {
            RunError::Plugin { message, .. } => assert_eq!(message, "entry exploded"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (_dir, runner, manifest) = setup(ENTRY);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = runner
            .run_with_cancel(
                manifest,
                Arc::new(NoopUpdater),
                Arc::new(NoopUpdater),
                cancel,
                |_| async {},
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Cancelled(RunStage::Created)));
    }

    #[tokio::test]
    async fn test_guest_config_write_reaches_both_bridges() {
        let entry = r#"
config.greeting = "hi";
manifest.name = "Renamed";
registerFeature(class Posts extends PostFeature {});
"#;
        let (_dir, runner, manifest) = setup(entry);

        let seen = Arc::new(Mutex::new(Vec::<Vec<ServiceConfig>>::new()));
        let recorder = seen.clone();
        let config_updater = Arc::new(move |configs: &[ServiceConfig]| {
            recorder.lock().unwrap().push(configs.to_vec());
        });

        let snapshot = runner
            .run(manifest, Arc::new(NoopUpdater), config_updater, |session| async move {
                session.manifest()
            })
            .await
            .unwrap();

        assert_eq!(snapshot.name, "Renamed");
        assert_eq!(snapshot.config("greeting").unwrap().value.as_deref(), Some("hi"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_manifest_configs_write_survives_config_write() {
        let entry = r#"
manifest.configs = manifest.configs.concat([{ key: "extra", type: "text", value: "kept" }]);
globalThis.extraSeen = config.extra;
config.greeting = "hi";
registerFeature(class Posts extends PostFeature {});
"#;
        for engine in ["v8", "boa"] {
            let (_dir, runner, manifest) = setup(entry);

            let manifests = Arc::new(Mutex::new(Vec::<ServiceManifest>::new()));
            let recorder = manifests.clone();
            let manifest_updater = Arc::new(move |m: &ServiceManifest| {
                recorder.lock().unwrap().push(m.clone());
            });

            let (snapshot, seen) = runner
                .with_engine(engine)
                .run(manifest, manifest_updater, Arc::new(NoopUpdater), |session| async move {
                    let seen = session.evaluate_json("globalThis.extraSeen").await.unwrap();
                    (session.manifest(), seen)
                })
                .await
                .unwrap();

            assert_eq!(seen, json!("kept"), "{}", engine);
            assert_eq!(snapshot.configs().len(), 2, "{}", engine);
            assert_eq!(snapshot.config("extra").unwrap().value.as_deref(), Some("kept"));
            assert_eq!(snapshot.config("greeting").unwrap().value.as_deref(), Some("hi"));
            assert_eq!(manifests.lock().unwrap().len(), 1, "{}", engine);
        }
    }

    #[tokio::test]
    async fn test_read_only_write_is_guest_visible() {
        let entry = r#"
let caught = null;
try { manifest.version = "9.9.9"; } catch (e) { caught = e.name; }
globalThis.caughtName = caught;
registerFeature(class Posts extends PostFeature {});
"#;
        let (_dir, runner, manifest) = setup(entry);

        let name = runner
            .run(manifest, Arc::new(NoopUpdater), Arc::new(NoopUpdater), |session| async move {
                session.evaluate_json("globalThis.caughtName").await.unwrap()
            })
            .await
            .unwrap();
        assert_eq!(name, json!("ReadOnlyFieldError"));
    }

    #[tokio::test]
    async fn test_reserved_registration_fails_in_entry() {
        let entry = "registerFeature(PostFeature);";
        let (_dir, runner, manifest) = setup(entry);

        let err = runner
            .run(manifest, Arc::new(NoopUpdater), Arc::new(NoopUpdater), |_| async {})
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Plugin { ref name, .. } if name == "ReservedFeature"));
    }
}
