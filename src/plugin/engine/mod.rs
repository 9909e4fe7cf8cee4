//! Script engine abstraction
//!
//! A uniform interface over interchangeable JavaScript backends. Every
//! backend exposes a single host-call primitive to guest code,
//! `__host_call(name, argsJson) -> envelopeJson`, which never throws. Host
//! functions installed as bindings are wrapped in small JS shims that unpack
//! the envelope and rethrow errors on the guest side, so guest exceptions and
//! host failures cross the boundary only as data.
//!
//! Backends:
//! - `v8`: deno_core `JsRuntime` (default)
//! - `boa`: boa_engine `Context`

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub mod boa;
pub mod deno;

pub use self::boa::BoaEngine;
pub use self::deno::V8Engine;

/// Name of the default backend
pub const DEFAULT_ENGINE: &str = "v8";

/// JS prelude shared by all backends
pub const PRELUDE: &str = include_str!("prelude.js");

/// Errors raised at the engine boundary
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Guest code threw (including syntax errors)
    #[error("{name}: {message}")]
    Guest { name: String, message: String },

    /// Engine-internal fault
    #[error("Engine fault: {0}")]
    Internal(String),

    /// The result of an evaluation could not be converted
    #[error("Failed to marshal result: {0}")]
    Marshal(String),

    #[error("Engine has been disposed")]
    Disposed,

    #[error("Unknown engine backend: {0}")]
    UnknownBackend(String),
}

impl EngineError {
    pub fn guest(name: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Guest {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Whether the failure originated in guest code
    pub fn is_guest(&self) -> bool {
        matches!(self, EngineError::Guest { .. })
    }
}

/// Failure reported by a host function; rethrown in the guest as an `Error`
/// whose `name` is set to [`HostError::name`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct HostError {
    pub name: String,
    pub message: String,
}

impl HostError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }
}

/// Host function callable from guest code. Receives the call arguments as a
/// JSON array.
pub type HostFunction = Arc<dyn Fn(Value) -> Result<Value, HostError> + Send + Sync>;

/// A value or function installed into the guest's global scope
#[derive(Clone)]
pub enum Binding {
    Value(Value),
    Function(HostFunction),
}

impl Binding {
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, HostError> + Send + Sync + 'static,
    {
        Binding::Function(Arc::new(f))
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Binding::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// Host functions reachable through `__host_call`
#[derive(Default, Clone)]
pub struct HostTable {
    functions: HashMap<String, HostFunction>,
}

impl HostTable {
    pub fn insert(&mut self, name: &str, function: HostFunction) {
        self.functions.insert(name.to_string(), function);
    }

    pub fn get(&self, name: &str) -> Option<HostFunction> {
        self.functions.get(name).cloned()
    }
}

/// Run a host function and encode the outcome as a JSON envelope:
/// `{"ok": value}` or `{"error": {"name", "message"}}`
pub(crate) fn dispatch(function: Option<HostFunction>, name: &str, args_json: &str) -> String {
    let outcome = match function {
        None => Err(HostError::new(
            "ReferenceError",
            format!("host function '{}' is not installed", name),
        )),
        Some(function) => match serde_json::from_str::<Value>(args_json) {
            Ok(args) => function(args),
            Err(e) => Err(HostError::type_error(format!("invalid arguments: {}", e))),
        },
    };

    match outcome {
        Ok(value) => json!({ "ok": value }).to_string(),
        Err(err) => json!({ "error": { "name": err.name, "message": err.message } }).to_string(),
    }
}

/// Script assigning a JSON value to a global
pub(crate) fn value_binding_script(name: &str, value: &Value) -> Result<String, EngineError> {
    let name = serde_json::to_string(name).map_err(|e| EngineError::Marshal(e.to_string()))?;
    let payload = serde_json::to_string(value)
        .and_then(|json| serde_json::to_string(&json))
        .map_err(|e| EngineError::Marshal(e.to_string()))?;
    Ok(format!("globalThis[{}] = JSON.parse({});", name, payload))
}

/// Script defining a guest-side wrapper around `__host_call`
pub(crate) fn function_binding_script(name: &str) -> Result<String, EngineError> {
    let name = serde_json::to_string(name).map_err(|e| EngineError::Marshal(e.to_string()))?;
    Ok(format!(
        r#"globalThis[{name}] = function (...args) {{
    const reply = JSON.parse(globalThis.__host_call({name}, JSON.stringify(args)));
    if (reply.error) {{
        const error = new Error(reply.error.message);
        error.name = reply.error.name;
        throw error;
    }}
    return reply.ok;
}};"#,
        name = name
    ))
}

const EVAL_PREFIX: &str = r#"
globalThis.__eval_status = "pending";
globalThis.__eval_result = undefined;
globalThis.__eval_error = undefined;
Promise.resolve()
    .then(() => (
"#;

const EVAL_SUFFIX: &str = r#"
    ))
    .then(
        (value) => {
            try {
                globalThis.__eval_result = JSON.stringify(value === undefined ? null : value);
                globalThis.__eval_status = "success";
            } catch (e) {
                globalThis.__eval_error = JSON.stringify({ name: "TypeError", message: String(e && e.message) });
                globalThis.__eval_status = "error";
            }
        },
        (error) => {
            const isObject = error !== null && typeof error === "object";
            globalThis.__eval_error = JSON.stringify({
                name: isObject && error.name ? String(error.name) : "Error",
                message: isObject && "message" in error ? String(error.message) : String(error),
            });
            globalThis.__eval_status = "error";
        });
"#;

const EVAL_CLEANUP: &str = r#"
globalThis.__eval_status = undefined;
globalThis.__eval_result = undefined;
globalThis.__eval_error = undefined;
"#;

#[derive(serde::Deserialize)]
struct GuestErrorPayload {
    name: String,
    message: String,
}

/// Aborts the guest code an engine is currently running
pub type Interrupt = Arc<dyn Fn() + Send + Sync>;

/// A single-threaded script engine session
///
/// Implementations are not `Send`; a session lives on one worker thread for
/// its whole lifetime.
#[async_trait(?Send)]
pub trait Engine {
    /// Backend name as registered in the [`EngineRegistry`]
    fn name(&self) -> &'static str;

    /// Install a value or host function under `name` in the global scope
    fn install_binding(&mut self, name: &str, binding: Binding) -> Result<(), EngineError>;

    /// Run a script and drive pending jobs until the engine is idle
    async fn execute(&mut self, label: &'static str, source: &str) -> Result<(), EngineError>;

    /// Read a global as a string; `None` for undefined or null
    fn read_global(&mut self, name: &str) -> Result<Option<String>, EngineError>;

    /// Handle that aborts running guest code from another thread, if the
    /// backend supports it
    fn interrupt_handle(&mut self) -> Option<Interrupt> {
        None
    }

    /// Release all engine resources. Idempotent.
    fn dispose(&mut self);

    fn is_disposed(&self) -> bool;

    async fn evaluate(&mut self, source: &str) -> Result<(), EngineError> {
        self.execute("<evaluate>", source).await
    }

    /// Evaluate an expression, await it if it is a promise, and return its
    /// JSON representation. `undefined` becomes `null`.
    async fn evaluate_json(&mut self, expression: &str) -> Result<Value, EngineError> {
        let script = format!("{}{}{}", EVAL_PREFIX, expression, EVAL_SUFFIX);
        self.execute("<evaluate>", &script).await?;

        let status = self.read_global("__eval_status")?;
        let outcome = match status.as_deref() {
            Some("success") => {
                let raw = self.read_global("__eval_result")?.unwrap_or_else(|| "null".to_string());
                serde_json::from_str(&raw).map_err(|e| EngineError::Marshal(e.to_string()))
            }
            Some("error") => {
                let raw = self.read_global("__eval_error")?.unwrap_or_default();
                match serde_json::from_str::<GuestErrorPayload>(&raw) {
                    Ok(payload) => Err(EngineError::guest(payload.name, payload.message)),
                    Err(_) => Err(EngineError::guest("Error", raw)),
                }
            }
            Some("pending") => Err(EngineError::Internal(
                "evaluation did not settle after the event loop drained".to_string(),
            )),
            other => Err(EngineError::Internal(format!(
                "invalid evaluation status: {:?}",
                other
            ))),
        };

        // Results can hold large JSON strings
        if let Err(e) = self.execute("<cleanup>", EVAL_CLEANUP).await {
            debug!(engine = self.name(), error = %e, "Failed to clear evaluation globals");
        }

        outcome
    }
}

impl dyn Engine {
    /// Evaluate an expression and deserialize its result
    pub async fn evaluate_typed<T: DeserializeOwned>(
        &mut self,
        expression: &str,
    ) -> Result<T, EngineError> {
        let value = self.evaluate_json(expression).await?;
        serde_json::from_value(value).map_err(|e| EngineError::Marshal(e.to_string()))
    }
}

/// Constructor for an engine backend
pub type EngineFactory = Arc<dyn Fn() -> Result<Box<dyn Engine>, EngineError> + Send + Sync>;

/// Backend table, built once at startup and passed to runners
#[derive(Clone)]
pub struct EngineRegistry {
    factories: HashMap<String, EngineFactory>,
    default: String,
}

impl EngineRegistry {
    /// Empty registry with the given default backend name
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            factories: HashMap::new(),
            default: default.into(),
        }
    }

    /// Registry holding the built-in backends, `v8` as default
    pub fn builtin() -> Self {
        let mut registry = Self::new(DEFAULT_ENGINE);
        registry.register(
            "v8",
            Arc::new(|| V8Engine::new().map(|e| Box::new(e) as Box<dyn Engine>)),
        );
        registry.register(
            "boa",
            Arc::new(|| BoaEngine::new().map(|e| Box::new(e) as Box<dyn Engine>)),
        );
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: EngineFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Change the default backend
    pub fn with_default(mut self, name: &str) -> Result<Self, EngineError> {
        if !self.factories.contains_key(name) {
            return Err(EngineError::UnknownBackend(name.to_string()));
        }
        self.default = name.to_string();
        Ok(self)
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up a backend by name, or the default when `name` is `None`
    pub fn factory(&self, name: Option<&str>) -> Result<(String, EngineFactory), EngineError> {
        let name = name.unwrap_or(&self.default);
        self.factories
            .get(name)
            .map(|f| (name.to_string(), f.clone()))
            .ok_or_else(|| EngineError::UnknownBackend(name.to_string()))
    }

    /// Construct an engine
    pub fn create(&self, name: Option<&str>) -> Result<Box<dyn Engine>, EngineError> {
        let (_, factory) = self.factory(name)?;
        factory()
    }
}

impl fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("backends", &self.names())
            .field("default", &self.default)
            .finish()
    }
}
