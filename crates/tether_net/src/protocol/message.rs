//! # Message Definitions
//!
//! Every frame is one [`Message`], discriminated by its `type` key.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tether_shared::{ObjectState, Vec2};

/// Unique identifier for an established connection.
///
/// Allocated by the host starting at 1 and never reused by the same host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Invalid/null connection ID.
    pub const NULL: Self = Self(0);

    /// Returns true if this is a null/invalid ID.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// RPC correlation id, allocated per calling endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RpcId(pub u64);

impl RpcId {
    /// Returned by `call_rpc` when the request never left the endpoint.
    pub const INVALID: Self = Self(0);

    /// Returns true unless this is [`RpcId::INVALID`].
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why the host refused a handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// `max_clients` connections are already established.
    Full,
    /// Protocol version mismatch.
    Proto,
    /// Missing or wrong shared-secret token.
    Auth,
}

impl RejectReason {
    /// Wire name of the reason.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Proto => "proto",
            Self::Auth => "auth",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to create an object on every peer.
///
/// Known keys are typed; anything else the simulation wants to carry rides
/// along in `extra`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SpawnSpec {
    /// Connection that authored the spawn. Set by the host on rebroadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ConnectionId>,
    /// Body shape name understood by the simulation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<String>,
    /// Initial position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Vec2>,
    /// Shape parameters.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    /// Seed for deterministic construction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Additional free-form keys.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SpawnSpec {
    /// Creates a spawn for a named shape at a position.
    #[must_use]
    pub fn shape(shape: impl Into<String>, position: impl Into<Vec2>) -> Self {
        Self {
            shape: Some(shape.into()),
            position: Some(position.into()),
            ..Self::default()
        }
    }

    /// Sets the shape parameters.
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Sets the construction seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// A single protocol message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// First frame from a client.
    Hello {
        /// Client protocol version.
        proto: String,
        /// `sign(secret)` when the client knows the shared secret.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Handshake accepted.
    Welcome {
        /// Identifier assigned to the new connection.
        client_id: ConnectionId,
        /// Host clock at accept time (ms).
        server_time: u64,
        /// Host protocol version.
        proto: String,
    },
    /// Handshake rejected.
    Error {
        /// Rejection reason.
        reason: RejectReason,
    },
    /// Keep-alive / RTT probe.
    Ping {
        /// Sender clock (ms).
        t: u64,
    },
    /// Reply to [`Message::Ping`].
    Pong {
        /// Echo of the ping timestamp.
        t: u64,
        /// Responder clock (ms).
        srv: u64,
    },
    /// Chat line.
    Chat {
        /// Sender connection, set by the host on rebroadcast.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ConnectionId>,
        /// Text.
        text: String,
    },
    /// Object creation request.
    Spawn(SpawnSpec),
    /// Raw player input.
    Input {
        /// Opaque input payload.
        #[serde(default)]
        payload: Value,
        /// Sender clock (ms).
        #[serde(default)]
        ts: u64,
    },
    /// Application-defined message.
    Custom {
        /// Application discriminator.
        subtype: String,
        /// Sender connection, set by the host when relaying.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ConnectionId>,
        /// Free-form body.
        #[serde(flatten)]
        data: Map<String, Value>,
    },
    /// Authoritative snapshot from the broadcast tick.
    State {
        /// Object records.
        objects: Vec<ObjectState>,
        /// Host clock (ms).
        ts: u64,
    },
    /// One object was created on the host.
    Create {
        /// The new object.
        object: ObjectState,
    },
    /// One object changed on the host.
    Update {
        /// The changed object.
        object: ObjectState,
    },
    /// Full world sent right after `welcome`.
    InitState {
        /// Object records.
        objects: Vec<ObjectState>,
    },
    /// RPC request.
    Rpc {
        /// Correlation id.
        id: RpcId,
        /// Handler name.
        name: String,
        /// Positional arguments.
        #[serde(default)]
        args: Vec<Value>,
        /// Keyword arguments.
        #[serde(default)]
        kwargs: Map<String, Value>,
    },
    /// RPC response.
    RpcResult {
        /// Correlation id of the request.
        id: RpcId,
        /// Whether the handler succeeded.
        ok: bool,
        /// Handler return value (absent on failure).
        #[serde(default, skip_serializing_if = "Value::is_null")]
        result: Value,
        /// Failure description.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Handler name of the request.
        name: String,
    },
}

impl Message {
    /// Wire discriminator of this message.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Welcome { .. } => "welcome",
            Self::Error { .. } => "error",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Chat { .. } => "chat",
            Self::Spawn(_) => "spawn",
            Self::Input { .. } => "input",
            Self::Custom { .. } => "custom",
            Self::State { .. } => "state",
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::InitState { .. } => "init_state",
            Self::Rpc { .. } => "rpc",
            Self::RpcResult { .. } => "rpc_result",
        }
    }

    /// Builds a successful `rpc_result`.
    #[must_use]
    pub fn rpc_ok(id: RpcId, name: impl Into<String>, result: Value) -> Self {
        Self::RpcResult {
            id,
            ok: true,
            result,
            error: None,
            name: name.into(),
        }
    }

    /// Builds a failed `rpc_result`.
    #[must_use]
    pub fn rpc_err(id: RpcId, name: impl Into<String>, error: impl Into<String>) -> Self {
        Self::RpcResult {
            id,
            ok: false,
            result: Value::Null,
            error: Some(error.into()),
            name: name.into(),
        }
    }
}
