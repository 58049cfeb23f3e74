//! # RPC Dispatch
//!
//! Named handlers invoked synchronously from the receive path.
//!
//! A handler's `Err` and a handler's panic both become
//! `rpc_result{ok:false}`; neither reaches the host.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::HandlerError;
use crate::protocol::ConnectionId;

/// Error string for a call to a name nobody registered.
pub const UNKNOWN_RPC: &str = "unknown_rpc";

/// Arguments of one RPC invocation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RpcArgs {
    /// Connection that made the call.
    pub caller: ConnectionId,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: Map<String, Value>,
}

impl RpcArgs {
    /// Positional argument `index`.
    #[must_use]
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Keyword argument `key`.
    #[must_use]
    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }

    /// Positional argument `index` as a string.
    ///
    /// # Errors
    ///
    /// Returns a `HandlerError` naming the index if it is missing or not a string.
    pub fn str_arg(&self, index: usize) -> Result<&str, HandlerError> {
        self.arg(index)
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError(format!("argument {index} must be a string")))
    }

    /// Positional argument `index` as a number.
    ///
    /// # Errors
    ///
    /// Returns a `HandlerError` naming the index if it is missing or not numeric.
    pub fn f64_arg(&self, index: usize) -> Result<f64, HandlerError> {
        self.arg(index)
            .and_then(Value::as_f64)
            .ok_or_else(|| HandlerError(format!("argument {index} must be a number")))
    }
}

/// Registered RPC handler.
pub type RpcHandler = Arc<dyn Fn(RpcArgs) -> Result<Value, HandlerError> + Send + Sync>;

/// Name -> handler table.
#[derive(Clone, Default)]
pub struct RpcRegistry {
    handlers: HashMap<String, RpcHandler>,
}

impl std::fmt::Debug for RpcRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcRegistry").field("names", &self.names()).finish()
    }
}

impl RpcRegistry {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(RpcArgs) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// Removes a handler. Returns true if one was registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    /// Looks up a handler.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<RpcHandler> {
        self.handlers.get(name).cloned()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Invokes a handler found with [`RpcRegistry::get`].
///
/// Taking the lookup result rather than the registry lets callers release
/// the registry lock before the handler runs.
///
/// # Errors
///
/// [`UNKNOWN_RPC`] when `handler` is `None`, otherwise as [`invoke`].
pub fn dispatch(handler: Option<&RpcHandler>, args: RpcArgs) -> Result<Value, String> {
    match handler {
        Some(handler) => invoke(handler, args),
        None => Err(UNKNOWN_RPC.to_string()),
    }
}

/// Runs a handler, turning errors and panics into an error string.
///
/// # Errors
///
/// The handler's error message, or the panic payload if it panicked.
pub fn invoke(handler: &RpcHandler, args: RpcArgs) -> Result<Value, String> {
    match catch_unwind(AssertUnwindSafe(|| handler(args))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.0),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> RpcRegistry {
        let mut rpc = RpcRegistry::new();
        rpc.register("echo", |call: RpcArgs| Ok(call.arg(0).cloned().unwrap_or(Value::Null)));
        rpc.register("add", |call: RpcArgs| Ok(json!(call.f64_arg(0)? + call.f64_arg(1)?)));
        rpc.register("fail", |_| Err(HandlerError::from("boom")));
        rpc.register("explode", |_| panic!("boom from panic"));
        rpc
    }

    fn run(rpc: &RpcRegistry, name: &str, args: Vec<Value>) -> Result<Value, String> {
        let call = RpcArgs {
            caller: ConnectionId(1),
            args,
            kwargs: Map::new(),
        };
        dispatch(rpc.get(name).as_ref(), call)
    }

    #[test]
    fn test_dispatch_ok() {
        let rpc = registry();
        assert_eq!(run(&rpc, "echo", vec![json!("hi")]), Ok(json!("hi")));
        assert_eq!(run(&rpc, "add", vec![json!(2), json!(3.5)]), Ok(json!(5.5)));
    }

    #[test]
    fn test_unknown_rpc_regardless_of_args() {
        let rpc = registry();
        assert_eq!(run(&rpc, "nope", vec![]), Err(UNKNOWN_RPC.to_string()));
        assert_eq!(
            run(&rpc, "nope", vec![json!(1), json!({"a": 2})]),
            Err(UNKNOWN_RPC.to_string())
        );
    }

    #[test]
    fn test_handler_error_and_panic() {
        let rpc = registry();
        assert_eq!(run(&rpc, "fail", vec![]), Err("boom".to_string()));
        let err = run(&rpc, "explode", vec![]).unwrap_err();
        assert!(err.contains("boom"));
        assert!(run(&rpc, "add", vec![json!("x")]).unwrap_err().contains("argument 0"));
    }

    #[test]
    fn test_register_replaces_and_unregisters() {
        let mut rpc = registry();
        rpc.register("echo", |_| Ok(json!("replaced")));
        assert_eq!(run(&rpc, "echo", vec![json!("hi")]), Ok(json!("replaced")));
        assert!(rpc.unregister("echo"));
        assert!(!rpc.unregister("echo"));
        assert_eq!(rpc.names(), vec!["add", "explode", "fail"]);
    }
}
