//! # Bridge Events
//!
//! Everything the network thread hands to the simulation thread.
//!
//! ## Event Flow for a client spawn
//! ```text
//! 1. Client sim: applies the spawn locally, bridge.broadcast_spawn(spec)
//! 2. Client net: spawn{...} -> host
//! 3. Host net:   tags from:<id>, rebroadcasts, NetEvent::Spawn -> host sim
//! 4. Other clients: NetEvent::Spawn -> their sim
//! 5. Author:     echo carries its own id, dropped by its bridge
//! ```

use std::net::SocketAddr;

use serde_json::{Map, Value};
use tether_shared::ObjectState;

use crate::client::RpcStatus;
use crate::protocol::{ConnectionId, RejectReason, SpawnSpec};

/// Bridge-local handle for an RPC issued through [`super::NetworkBridge::call_rpc`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RpcTicket(pub u64);

/// Connection status changes.
#[derive(Clone, Debug, PartialEq)]
pub enum NetStatus {
    /// Host is listening.
    Hosting {
        /// Bound address.
        addr: SocketAddr,
    },
    /// Host stopped.
    HostStopped,
    /// Client stream is being opened.
    Connecting,
    /// Client was welcomed.
    Connected {
        /// Identifier assigned by the host.
        client_id: ConnectionId,
    },
    /// Host refused the client.
    Rejected(RejectReason),
    /// Client session ended.
    Disconnected,
    /// An operation failed on the network thread.
    Error(String),
}

/// One inbound network event.
#[derive(Clone, Debug, PartialEq)]
pub enum NetEvent {
    /// Status change.
    Status(NetStatus),
    /// A client was welcomed (host side).
    ClientJoined(ConnectionId),
    /// A client left (host side).
    ClientLeft(ConnectionId),
    /// Object creation authored elsewhere.
    Spawn(SpawnSpec),
    /// Authoritative snapshot.
    State {
        /// Object records.
        objects: Vec<ObjectState>,
        /// Host clock (ms).
        ts: u64,
    },
    /// Full world right after connecting.
    InitState(Vec<ObjectState>),
    /// One object created by the host.
    Create(ObjectState),
    /// One object changed by the host.
    Update(ObjectState),
    /// Application-defined message.
    Custom {
        /// Sender, when known.
        from: Option<ConnectionId>,
        /// Application discriminator.
        subtype: String,
        /// Body.
        data: Map<String, Value>,
    },
    /// Player input (host side).
    Input {
        /// Sender.
        from: ConnectionId,
        /// Opaque payload.
        payload: Value,
        /// Sender clock (ms).
        ts: u64,
    },
    /// Chat line.
    Chat {
        /// Sender, `None` for the host.
        from: Option<ConnectionId>,
        /// Text.
        text: String,
    },
    /// An RPC issued through the bridge finished.
    RpcResolved {
        /// Ticket returned by `call_rpc`.
        ticket: RpcTicket,
        /// Final status (`done` is always true).
        status: RpcStatus,
    },
}
