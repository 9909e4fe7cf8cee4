//! Session worker
//!
//! Engines are single-threaded, so each live session gets a dedicated thread
//! running a current-thread tokio runtime. Commands arrive over a channel and
//! are handled one at a time; calls against the same session never
//! interleave. The engine is disposed when the loop ends, whichever way it
//! ends: an explicit dispose, a closed channel, or cancellation.
//!
//! Disposing while a guest call is still running interrupts the guest on
//! backends that support it. Elsewhere `dispose` waits up to
//! [`DISPOSE_GRACE`] and returns; the worker disposes its engine as soon as
//! the call finishes.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bridge::{ConfigBridge, ManifestBridge};
use super::engine::{Binding, EngineError, EngineFactory, Interrupt};
use super::features::{Capability, Feature, FeatureError, FeatureRegistry};
use super::operations::FetchError;
use super::types::{ServiceConfig, ServiceId, ServiceManifest};

/// How long `dispose` waits for a running call it cannot interrupt
pub const DISPOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Session is closed")]
    Closed,

    #[error("Failed to start session worker: {0}")]
    Spawn(String),
}

/// Command sent to the session worker thread
enum Command {
    InstallBinding {
        name: String,
        binding: Binding,
        resp: oneshot::Sender<Result<(), EngineError>>,
    },
    Execute {
        label: &'static str,
        source: String,
        resp: oneshot::Sender<Result<(), EngineError>>,
    },
    Evaluate {
        expression: String,
        resp: oneshot::Sender<Result<Value, EngineError>>,
    },
    Dispose {
        resp: oneshot::Sender<()>,
    },
}

/// Handle to a session worker thread.
///
/// Dropping the handle cancels the worker, which then disposes its engine.
pub struct SessionWorker {
    service_id: ServiceId,
    engine_name: String,
    tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    busy: Arc<AtomicBool>,
    interrupt: Option<Interrupt>,
}

impl SessionWorker {
    /// Spawn a worker and create its engine on the worker thread
    pub async fn spawn(
        service_id: &str,
        engine_name: &str,
        factory: EngineFactory,
        cancel: CancellationToken,
    ) -> Result<Self, SessionError> {
        let (tx, mut rx) = mpsc::channel::<Command>(32);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<Option<Interrupt>, EngineError>>();

        let worker_id = service_id.to_string();
        let worker_cancel = cancel.clone();
        let busy = Arc::new(AtomicBool::new(false));
        let worker_busy = busy.clone();

        thread::Builder::new()
            .name(format!("service-{}", service_id))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(service = %worker_id, "Failed to create session runtime: {}", e);
                        let _ = ready_tx.send(Err(EngineError::Internal(e.to_string())));
                        return;
                    }
                };

                let local = tokio::task::LocalSet::new();

                local.block_on(&rt, async move {
                    let mut engine = match factory() {
                        Ok(engine) => engine,
                        Err(e) => {
                            error!(service = %worker_id, "Failed to create engine: {}", e);
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(engine.interrupt_handle()));

                    debug!(service = %worker_id, engine = engine.name(), "Session worker ready");

                    loop {
                        let cmd = tokio::select! {
                            _ = worker_cancel.cancelled() => {
                                debug!(service = %worker_id, "Session cancelled");
                                break;
                            }
                            cmd = rx.recv() => cmd,
                        };

                        match cmd {
                            None => break,
                            Some(Command::InstallBinding { name, binding, resp }) => {
                                let _ = resp.send(engine.install_binding(&name, binding));
                            }
                            Some(Command::Execute { label, source, resp }) => {
                                worker_busy.store(true, Ordering::SeqCst);
                                let result = engine.execute(label, &source).await;
                                worker_busy.store(false, Ordering::SeqCst);
                                let _ = resp.send(result);
                            }
                            Some(Command::Evaluate { expression, resp }) => {
                                worker_busy.store(true, Ordering::SeqCst);
                                let result = engine.evaluate_json(&expression).await;
                                worker_busy.store(false, Ordering::SeqCst);
                                let _ = resp.send(result);
                            }
                            Some(Command::Dispose { resp }) => {
                                engine.dispose();
                                let _ = resp.send(());
                                break;
                            }
                        }
                    }

                    engine.dispose();
                    debug!(service = %worker_id, "Session worker exiting");
                });
            })
            .map_err(|e| SessionError::Spawn(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(interrupt)) => Ok(Self {
                service_id: service_id.to_string(),
                engine_name: engine_name.to_string(),
                tx,
                cancel,
                busy,
                interrupt,
            }),
            Ok(Err(e)) => Err(SessionError::Engine(e)),
            Err(_) => Err(SessionError::Spawn("worker exited during startup".to_string())),
        }
    }

    pub fn engine_name(&self) -> &str {
        &self.engine_name
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
        timeout: Option<Duration>,
    ) -> Result<T, SessionError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(build(resp_tx))
            .await
            .map_err(|_| SessionError::Closed)?;

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, resp_rx).await {
                Ok(reply) => reply.map_err(|_| SessionError::Closed),
                Err(_) => Err(SessionError::Timeout(limit)),
            },
            None => resp_rx.await.map_err(|_| SessionError::Closed),
        }
    }

    pub async fn install_binding(&self, name: &str, binding: Binding) -> Result<(), SessionError> {
        let name = name.to_string();
        self.request(|resp| Command::InstallBinding { name, binding, resp }, None)
            .await?
            .map_err(SessionError::from)
    }

    pub async fn execute(&self, label: &'static str, source: String) -> Result<(), SessionError> {
        self.request(|resp| Command::Execute { label, source, resp }, None)
            .await?
            .map_err(SessionError::from)
    }

    pub async fn evaluate_json(
        &self,
        expression: String,
        timeout: Option<Duration>,
    ) -> Result<Value, SessionError> {
        self.request(|resp| Command::Evaluate { expression, resp }, timeout)
            .await?
            .map_err(SessionError::from)
    }

    /// Dispose the engine and stop the worker. Safe to call more than once.
    pub async fn dispose(&self) {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self.tx.send(Command::Dispose { resp: resp_tx }).await.is_ok() {
            let running = self.busy.load(Ordering::SeqCst);
            match (&self.interrupt, running) {
                (Some(interrupt), true) => {
                    debug!(service = %self.service_id, "Interrupting running guest call");
                    interrupt();
                    let _ = resp_rx.await;
                }
                (None, true) => {
                    if tokio::time::timeout(DISPOSE_GRACE, resp_rx).await.is_err() {
                        warn!(
                            service = %self.service_id,
                            engine = %self.engine_name,
                            "Guest call still running; engine will be disposed when it returns"
                        );
                    }
                }
                (_, false) => {
                    let _ = resp_rx.await;
                }
            }
        }
        self.cancel.cancel();
        info!(service = %self.service_id, engine = %self.engine_name, "Session disposed");
    }
}

impl Drop for SessionWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A ready service session, handed to the body of a run
#[derive(Clone)]
pub struct ServiceSession {
    id: ServiceId,
    worker: Arc<SessionWorker>,
    features: Arc<Mutex<FeatureRegistry>>,
    manifest: Arc<ManifestBridge>,
    configs: Arc<ConfigBridge>,
    call_timeout: Option<Duration>,
}

impl ServiceSession {
    pub(crate) fn new(
        worker: Arc<SessionWorker>,
        features: Arc<Mutex<FeatureRegistry>>,
        manifest: Arc<ManifestBridge>,
        configs: Arc<ConfigBridge>,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id: worker.service_id.clone(),
            worker,
            features,
            manifest,
            configs,
            call_timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn engine_name(&self) -> &str {
        self.worker.engine_name()
    }

    /// Current manifest, including writes made by the service
    pub fn manifest(&self) -> ServiceManifest {
        self.manifest.snapshot()
    }

    pub fn configs(&self) -> Vec<ServiceConfig> {
        self.configs.snapshot()
    }

    pub fn manifest_bridge(&self) -> &ManifestBridge {
        &self.manifest
    }

    pub fn config_bridge(&self) -> &ConfigBridge {
        &self.configs
    }

    pub fn is_registered(&self, capability: &Capability) -> bool {
        lock(&self.features).is_registered(capability)
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        lock(&self.features).capabilities()
    }

    /// Feature handle for a capability, created on first request
    pub fn feature(&self, capability: &Capability) -> Result<Arc<dyn Feature>, FeatureError> {
        lock(&self.features).get_or_create(capability)
    }

    /// Evaluate an expression in the session
    pub async fn evaluate_json(&self, expression: &str) -> Result<Value, SessionError> {
        self.worker
            .evaluate_json(expression.to_string(), self.call_timeout)
            .await
    }

    /// Call `method` on the feature registered for `capability`
    pub async fn invoke(
        &self,
        capability: &Capability,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, FetchError> {
        let feature = self
            .feature(capability)
            .map_err(|_| FetchError::FeatureAbsent {
                capability: capability.clone(),
            })?;

        debug!(
            service = %self.id,
            capability = %capability,
            class = feature.class_name(),
            method,
            "Invoking feature"
        );

        let expression = format!(
            "__services.invoke({}, {}, {})",
            Value::String(capability.tag()),
            Value::String(method.to_string()),
            Value::Array(args)
        );

        self.evaluate_json(&expression).await.map_err(FetchError::from)
    }
}
