//! Host event callbacks.
//!
//! Callbacks run on the network scheduler, outside every registry lock.
//! Errors and panics are logged and swallowed.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::{Map, Value};
use tether_shared::ObjectState;
use tracing::warn;

use super::rpc::panic_message;
use crate::error::HandlerError;
use crate::protocol::{ConnectionId, SpawnSpec};

/// Outcome of an event callback.
pub type HookResult = Result<(), HandlerError>;

pub(crate) type ConnectionHook = Arc<dyn Fn(ConnectionId) -> HookResult + Send + Sync>;
pub(crate) type InputHook = Arc<dyn Fn(ConnectionId, &Value, u64) -> HookResult + Send + Sync>;
pub(crate) type ChatHook = Arc<dyn Fn(ConnectionId, &str) -> HookResult + Send + Sync>;
pub(crate) type SpawnHook = Arc<dyn Fn(ConnectionId, &SpawnSpec) -> HookResult + Send + Sync>;
pub(crate) type CustomHook = Arc<dyn Fn(ConnectionId, &str, &Map<String, Value>) -> HookResult + Send + Sync>;
pub(crate) type StateProvider = Arc<dyn Fn() -> Vec<ObjectState> + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub client: Option<ConnectionHook>,
    pub disconnect: Option<ConnectionHook>,
    pub input: Option<InputHook>,
    pub chat: Option<ChatHook>,
    pub spawn: Option<SpawnHook>,
    pub custom: Option<CustomHook>,
    pub state_provider: Option<StateProvider>,
}

/// Runs a callback, logging its error or panic.
pub(crate) fn guarded(hook: &'static str, f: impl FnOnce() -> HookResult) {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(hook, error = %err, "callback failed"),
        Err(payload) => warn!(hook, panic = %panic_message(payload.as_ref()), "callback panicked"),
    }
}

/// Pulls a snapshot; `None` if the provider panicked.
pub(crate) fn snapshot(provider: &StateProvider) -> Option<Vec<ObjectState>> {
    match catch_unwind(AssertUnwindSafe(|| provider())) {
        Ok(objects) => Some(objects),
        Err(payload) => {
            warn!(panic = %panic_message(payload.as_ref()), "state provider panicked");
            None
        }
    }
}
