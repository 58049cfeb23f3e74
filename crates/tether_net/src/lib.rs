//! # Tether Net - Multiplayer Synchronization
//!
//! Network layer that keeps many simulation clients in step with one
//! authoritative host.
//!
//! ## Architecture
//!
//! This crate implements the complete networking stack:
//!
//! - **Protocol**: newline-delimited JSON frames with an optional compressed envelope
//! - **Connection**: partial-read buffering, one decoded message per line
//! - **Host**: handshake, per-connection receive tasks, RPC dispatch, broadcast tick
//! - **Client**: non-blocking polled endpoint with RPC correlation
//! - **Bridge**: runs either engine on its own thread and hands events to the
//!   simulation loop through a FIFO queue
//!
//! ## Threading Model
//!
//! ```text
//! SIMULATION THREAD                NETWORK THREAD (tokio, current-thread)
//!   |                                 |
//!   |--- BridgeCommand (fire&forget)->|  accept / recv / tick tasks
//!   |                                 |
//!   |<-- NetEvent queue (drained) ----|  hooks push events
//!   |                                 |
//!   |    SnapshotCell <---- read -----|  state provider (broadcast tick)
//! ```
//!
//! Simulation state is only ever mutated on the simulation thread.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tether_net::{bridge::NetworkBridge, HostConfig};
//!
//! let mut bridge = NetworkBridge::spawn()?;
//! bridge.share_snapshots(&snapshots);
//! bridge.start_host(HostConfig::default());
//!
//! loop {
//!     bridge.update(frame_dt, &mut simulation);
//!     // step physics, render...
//!     snapshots.publish(simulation.objects());
//! }
//! ```

#![deny(unsafe_code)]

pub mod bridge;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod host;
pub mod protocol;

// Re-exports for convenience
pub use bridge::{BridgeCommand, NetEvent, NetStatus, NetworkBridge, RpcTicket, Simulation, SnapshotCell};
pub use client::{ClientEngine, ClientState, RpcStatus};
pub use config::{ClientConfig, HostConfig};
pub use connection::{Connection, FrameBuffer};
pub use error::{HandlerError, NetError, NetResult};
pub use host::{ConnectionId, HostEngine, RpcArgs, SessionRegistry, TickStats};
pub use protocol::{decode, encode, now, sign, Message, RejectReason, RpcId, SpawnSpec};
pub use tether_shared::{ObjectState, Vec2, PROTOCOL_VERSION};
