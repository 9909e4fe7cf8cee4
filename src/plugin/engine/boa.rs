//! Pure-Rust backend on boa_engine
//!
//! Host calls go through a native global function capturing the session's
//! [`HostTable`]. Promise jobs are drained after every script.

use async_trait::async_trait;
use boa_engine::{
    js_string, Context, JsArgs, JsError, JsString, JsValue, NativeFunction, Source,
};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

use super::{
    dispatch, function_binding_script, value_binding_script, Binding, Engine, EngineError,
    HostTable,
};

/// boa_engine session
pub struct BoaEngine {
    context: Option<Context>,
    table: Rc<RefCell<HostTable>>,
}

impl BoaEngine {
    pub fn new() -> Result<Self, EngineError> {
        let mut context = Context::default();
        let table = Rc::new(RefCell::new(HostTable::default()));

        let captured = table.clone();
        // SAFETY: the closure captures only host-side data, no garbage
        // collected values, so it needs no tracing.
        let host_call = unsafe {
            NativeFunction::from_closure(move |_this, args, context| {
                let name = args
                    .get_or_undefined(0)
                    .to_string(context)?
                    .to_std_string_escaped();
                let payload = args
                    .get_or_undefined(1)
                    .to_string(context)?
                    .to_std_string_escaped();

                let function = captured.borrow().get(&name);
                let envelope = dispatch(function, &name, &payload);
                Ok(JsValue::from(JsString::from(envelope.as_str())))
            })
        };

        context
            .register_global_callable(js_string!("__host_call"), 2, host_call)
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        debug!(engine = "boa", "Created engine session");
        Ok(Self {
            context: Some(context),
            table,
        })
    }

    fn context(&mut self) -> Result<&mut Context, EngineError> {
        self.context.as_mut().ok_or(EngineError::Disposed)
    }

    fn run_script(&mut self, source: &str) -> Result<(), EngineError> {
        let context = self.context()?;
        match context.eval(Source::from_bytes(source)) {
            Ok(_) => Ok(()),
            Err(e) => Err(convert_error(e, context)),
        }
    }
}

/// Convert a thrown value, keeping the guest's error name and message
fn convert_error(err: JsError, context: &mut Context) -> EngineError {
    let thrown = err.to_opaque(context);

    let Some(object) = thrown.as_object().cloned() else {
        let message = thrown
            .to_string(context)
            .map(|s| s.to_std_string_escaped())
            .unwrap_or_else(|_| err.to_string());
        return EngineError::guest("Error", message);
    };

    let mut property = |key: JsString| -> Option<String> {
        let value = object.get(key, context).ok()?;
        if value.is_undefined() || value.is_null() {
            return None;
        }
        value.to_string(context).ok().map(|s| s.to_std_string_escaped())
    };

    let name = property(js_string!("name")).unwrap_or_else(|| "Error".to_string());
    let message = property(js_string!("message")).unwrap_or_else(|| err.to_string());
    EngineError::Guest { name, message }
}

#[async_trait(?Send)]
impl Engine for BoaEngine {
    fn name(&self) -> &'static str {
        "boa"
    }

    fn install_binding(&mut self, name: &str, binding: Binding) -> Result<(), EngineError> {
        match binding {
            Binding::Value(value) => {
                let script = value_binding_script(name, &value)?;
                self.run_script(&script)
            }
            Binding::Function(function) => {
                if self.is_disposed() {
                    return Err(EngineError::Disposed);
                }
                self.table.borrow_mut().insert(name, function);
                let script = function_binding_script(name)?;
                self.run_script(&script)
            }
        }
    }

    async fn execute(&mut self, _label: &'static str, source: &str) -> Result<(), EngineError> {
        self.run_script(source)?;
        self.context()?.run_jobs();
        Ok(())
    }

    fn read_global(&mut self, name: &str) -> Result<Option<String>, EngineError> {
        let context = self.context()?;
        let value = context
            .global_object()
            .get(JsString::from(name), context)
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        if value.is_undefined() || value.is_null() {
            return Ok(None);
        }

        value
            .to_string(context)
            .map(|s| Some(s.to_std_string_escaped()))
            .map_err(|e| EngineError::Internal(e.to_string()))
    }

    fn dispose(&mut self) {
        if self.context.take().is_some() {
            *self.table.borrow_mut() = HostTable::default();
            debug!(engine = "boa", "Disposed engine session");
        }
    }

    fn is_disposed(&self) -> bool {
        self.context.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_promise_jobs_are_drained() {
        let mut engine = BoaEngine::new().unwrap();
        engine
            .evaluate("globalThis.done = false; Promise.resolve().then(() => { globalThis.done = true; });")
            .await
            .unwrap();
        assert_eq!(engine.read_global("done").unwrap().as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn test_thrown_primitive_is_converted() {
        let mut engine = BoaEngine::new().unwrap();
        let err = engine.evaluate("throw 'plain string';").await.unwrap_err();
        match err {
            EngineError::Guest { name, message } => {
                assert_eq!(name, "Error");
                assert_eq!(message, "plain string");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispose_releases_host_functions() {
        let mut engine = BoaEngine::new().unwrap();
        engine
            .install_binding("__ping", Binding::function(|_| Ok(json!("pong"))))
            .unwrap();
        assert_eq!(engine.evaluate_json("__ping()").await.unwrap(), json!("pong"));

        engine.dispose();
        assert!(engine.table.borrow().get("__ping").is_none());
        assert!(matches!(
            engine.install_binding("__ping", Binding::Value(json!(1))),
            Err(EngineError::Disposed)
        ));
    }
}
