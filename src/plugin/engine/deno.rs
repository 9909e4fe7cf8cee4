//! V8 backend on deno_core
//!
//! Host calls go through one synchronous op that looks up the target in a
//! [`HostTable`] kept in the runtime's `OpState`.

use async_trait::async_trait;
use deno_core::error::{AnyError, JsError};
use deno_core::{op2, v8, Extension, JsRuntime, Op, OpState, RuntimeOptions};
use tracing::debug;

use std::sync::Arc;

use super::{
    dispatch, function_binding_script, value_binding_script, Binding, Engine, EngineError,
    HostTable, Interrupt,
};

#[op2]
#[string]
fn op_host_call(state: &mut OpState, #[string] name: String, #[string] args: String) -> String {
    let function = state.borrow::<HostTable>().get(&name);
    dispatch(function, &name, &args)
}

const HOST_CALL_SHIM: &str = r#"
globalThis.__host_call = (name, args) => Deno.core.ops.op_host_call(name, args);
"#;

/// deno_core session
pub struct V8Engine {
    runtime: Option<JsRuntime>,
}

impl V8Engine {
    pub fn new() -> Result<Self, EngineError> {
        let ext = Extension {
            name: "service_host",
            ops: std::borrow::Cow::Borrowed(&[op_host_call::DECL]),
            ..Default::default()
        };

        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![ext],
            ..Default::default()
        });
        runtime.op_state().borrow_mut().put(HostTable::default());

        runtime
            .execute_script("<host_call>", HOST_CALL_SHIM.to_string().into())
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        debug!(engine = "v8", "Created engine session");
        Ok(Self {
            runtime: Some(runtime),
        })
    }

    fn runtime(&mut self) -> Result<&mut JsRuntime, EngineError> {
        self.runtime.as_mut().ok_or(EngineError::Disposed)
    }

    fn run_script(&mut self, label: &'static str, source: String) -> Result<(), EngineError> {
        self.runtime()?
            .execute_script(label, source.into())
            .map(|_| ())
            .map_err(convert_error)
    }
}

/// Convert a deno_core error, keeping the guest's error name and message
fn convert_error(err: AnyError) -> EngineError {
    match err.downcast_ref::<JsError>() {
        Some(js) => {
            let name = js.name.clone().unwrap_or_else(|| "Error".to_string());
            let message = js
                .message
                .clone()
                .unwrap_or_else(|| js.exception_message.clone());
            EngineError::Guest { name, message }
        }
        None => EngineError::Internal(err.to_string()),
    }
}

#[async_trait(?Send)]
impl Engine for V8Engine {
    fn name(&self) -> &'static str {
        "v8"
    }

    fn install_binding(&mut self, name: &str, binding: Binding) -> Result<(), EngineError> {
        match binding {
            Binding::Value(value) => {
                let script = value_binding_script(name, &value)?;
                self.run_script("<binding>", script)
            }
            Binding::Function(function) => {
                self.runtime()?
                    .op_state()
                    .borrow_mut()
                    .borrow_mut::<HostTable>()
                    .insert(name, function);
                let script = function_binding_script(name)?;
                self.run_script("<binding>", script)
            }
        }
    }

    async fn execute(&mut self, label: &'static str, source: &str) -> Result<(), EngineError> {
        self.run_script(label, source.to_string())?;
        self.runtime()?
            .run_event_loop(Default::default())
            .await
            .map_err(convert_error)
    }

    fn read_global(&mut self, name: &str) -> Result<Option<String>, EngineError> {
        let runtime = self.runtime()?;
        let scope = &mut runtime.handle_scope();
        let context = scope.get_current_context();
        let global = context.global(scope);

        let key = v8::String::new(scope, name)
            .ok_or_else(|| EngineError::Internal(format!("invalid global name: {}", name)))?;
        let Some(value) = global.get(scope, key.into()) else {
            return Ok(None);
        };
        if value.is_undefined() || value.is_null() {
            return Ok(None);
        }

        Ok(value
            .to_string(scope)
            .map(|s| s.to_rust_string_lossy(scope)))
    }

    fn interrupt_handle(&mut self) -> Option<Interrupt> {
        let handle = self.runtime.as_mut()?.v8_isolate().thread_safe_handle();
        Some(Arc::new(move || {
            handle.terminate_execution();
        }))
    }

    fn dispose(&mut self) {
        if let Some(mut runtime) = self.runtime.take() {
            runtime.v8_isolate().low_memory_notification();
            drop(runtime);
            debug!(engine = "v8", "Disposed engine session");
        }
    }

    fn is_disposed(&self) -> bool {
        self.runtime.is_none()
    }
}

impl Drop for V8Engine {
    fn drop(&mut self) {
        self.dispose();
    }
}
