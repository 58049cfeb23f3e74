//! Caller-side RPC correlation table.

use std::collections::HashMap;

use serde_json::Value;

use crate::protocol::RpcId;

/// Progress of one outgoing RPC call.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcStatus {
    /// True once the `rpc_result` arrived.
    pub done: bool,
    /// Handler success (meaningless until `done`).
    pub ok: bool,
    /// Handler return value.
    pub result: Value,
    /// Failure description.
    pub error: Option<String>,
    /// Name the call was made with.
    pub name: String,
}

impl RpcStatus {
    fn pending(name: String) -> Self {
        Self {
            done: false,
            ok: false,
            result: Value::Null,
            error: None,
            name,
        }
    }
}

/// Outstanding and resolved calls of one endpoint.
#[derive(Debug, Default)]
pub struct PendingCalls {
    last_id: u64,
    calls: HashMap<RpcId, RpcStatus>,
}

impl PendingCalls {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next correlation id without registering it.
    pub fn next_id(&mut self) -> RpcId {
        self.last_id += 1;
        RpcId(self.last_id)
    }

    /// Registers a sent call as pending.
    pub fn insert(&mut self, id: RpcId, name: impl Into<String>) {
        self.calls.insert(id, RpcStatus::pending(name.into()));
    }

    /// Applies an `rpc_result`. Returns false for ids this table never issued.
    pub fn resolve(&mut self, id: RpcId, ok: bool, result: Value, error: Option<String>) -> bool {
        let Some(status) = self.calls.get_mut(&id) else {
            return false;
        };
        status.done = true;
        status.ok = ok;
        status.result = result;
        status.error = error;
        true
    }

    /// Current status of a call.
    #[must_use]
    pub fn get(&self, id: RpcId) -> Option<&RpcStatus> {
        self.calls.get(&id)
    }

    /// Removes and returns a call, typically once it is done.
    pub fn take(&mut self, id: RpcId) -> Option<RpcStatus> {
        self.calls.remove(&id)
    }

    /// Calls still waiting for a result.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.calls.values().filter(|s| !s.done).count()
    }

    /// Forgets every call.
    pub fn clear(&mut self) {
        self.calls.clear();
    }
}
