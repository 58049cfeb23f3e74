//! # Main-Loop Bridge
//!
//! Runs the network engines on their own thread and hands results to the
//! simulation loop.
//!
//! ## Data Flow
//!
//! ```text
//! simulation thread                       network thread
//!   bridge.send_chat(..) ──BridgeCommand──> Worker (host or client)
//!   bridge.update(dt, sim) <──NetEvent───── hooks / client poll
//!   cell.publish(..)     ──SnapshotCell──> state provider (tick)
//! ```
//!
//! Outbound calls are fire-and-forget. Failures come back as
//! [`NetStatus::Error`] events, never as panics on the simulation thread.

mod events;
mod snapshot;
mod traits;
mod worker;

pub use events::{NetEvent, NetStatus, RpcTicket};
pub use snapshot::SnapshotCell;
pub use traits::Simulation;

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use serde_json::{Map, Value};
use tether_shared::ObjectState;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::warn;

use self::worker::{BridgeRpc, StateSource, Worker};
use crate::config::{ClientConfig, HostConfig};
use crate::error::{HandlerError, NetError, NetResult};
use crate::host::RpcArgs;
use crate::protocol::SpawnSpec;

/// Work item for the network thread.
pub enum BridgeCommand {
    /// Start hosting.
    StartHost(HostConfig),
    /// Connect to a host.
    Connect(ClientConfig),
    /// Chat line (host: broadcast, client: to host).
    SendChat(String),
    /// Spawn authored here (host: broadcast, client: to host).
    BroadcastSpawn(SpawnSpec),
    /// Input payload (client only).
    SendInput(Value),
    /// Application message (host: broadcast, client: to host).
    SendCustom {
        /// Application discriminator.
        subtype: String,
        /// Body.
        data: Map<String, Value>,
    },
    /// Announce a created object (host only).
    BroadcastCreate(ObjectState),
    /// Announce a changed object (host only).
    BroadcastUpdate(ObjectState),
    /// Remote call (client only); resolved through `NetEvent::RpcResolved`.
    CallRpc {
        /// Ticket the result will carry.
        ticket: RpcTicket,
        /// Handler name.
        name: String,
        /// Positional arguments.
        args: Vec<Value>,
        /// Keyword arguments.
        kwargs: Map<String, Value>,
    },
    /// Handler for calls made to this host.
    RegisterRpc {
        /// Handler name.
        name: String,
        /// Handler.
        handler: BridgeRpc,
    },
    /// Snapshot source for the broadcast tick.
    SetStateProvider(StateSource),
    /// Run `command` after `delay`.
    SendAfter {
        /// Delay on the network scheduler.
        delay: Duration,
        /// Command to run.
        command: Box<BridgeCommand>,
    },
    /// Stop hosting or close the client.
    Disconnect,
    /// Stop everything and end the network thread.
    Shutdown,
}

impl std::fmt::Debug for BridgeCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::StartHost(_) => "StartHost",
            Self::Connect(_) => "Connect",
            Self::SendChat(_) => "SendChat",
            Self::BroadcastSpawn(_) => "BroadcastSpawn",
            Self::SendInput(_) => "SendInput",
            Self::SendCustom { .. } => "SendCustom",
            Self::BroadcastCreate(_) => "BroadcastCreate",
            Self::BroadcastUpdate(_) => "BroadcastUpdate",
            Self::CallRpc { .. } => "CallRpc",
            Self::RegisterRpc { .. } => "RegisterRpc",
            Self::SetStateProvider(_) => "SetStateProvider",
            Self::SendAfter { .. } => "SendAfter",
            Self::Disconnect => "Disconnect",
            Self::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

/// Simulation-side handle to the network thread.
#[derive(Debug)]
pub struct NetworkBridge {
    commands: UnboundedSender<BridgeCommand>,
    events: Receiver<NetEvent>,
    thread: Option<JoinHandle<()>>,
    last_ticket: u64,
}

impl NetworkBridge {
    /// Starts the network thread with its own current-thread runtime.
    ///
    /// # Errors
    ///
    /// `Io` if the runtime or the thread cannot be created.
    pub fn spawn() -> NetResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name("tether-net")
            .build()?;

        let (command_tx, command_rx) = unbounded_channel();
        let (event_tx, event_rx) = unbounded();
        let loopback = command_tx.clone();

        let thread = std::thread::Builder::new()
            .name("tether-net".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    Worker::new(event_tx, loopback).run(command_rx).await;
                });
            })?;

        Ok(Self {
            commands: command_tx,
            events: event_rx,
            thread: Some(thread),
            last_ticket: 0,
        })
    }

    fn command(&self, command: BridgeCommand) {
        if self.commands.send(command).is_err() {
            warn!("network thread is gone, command dropped");
        }
    }

    /// Starts hosting. Reports `NetStatus::Hosting` or `NetStatus::Error`.
    pub fn start_host(&self, config: HostConfig) {
        self.command(BridgeCommand::StartHost(config));
    }

    /// Connects to a host. Reports `Connecting`, then `Connected`,
    /// `Rejected` or `Error` followed by `Disconnected`.
    pub fn connect(&self, config: ClientConfig) {
        self.command(BridgeCommand::Connect(config));
    }

    /// Sends a chat line.
    pub fn send_chat(&self, text: impl Into<String>) {
        self.command(BridgeCommand::SendChat(text.into()));
    }

    /// Shares a spawn the simulation has already applied locally.
    pub fn broadcast_spawn(&self, spec: SpawnSpec) {
        self.command(BridgeCommand::BroadcastSpawn(spec));
    }

    /// Sends an input payload to the host.
    pub fn send_input(&self, payload: Value) {
        self.command(BridgeCommand::SendInput(payload));
    }

    /// Sends an application-defined message.
    pub fn send_custom(&self, subtype: impl Into<String>, data: Map<String, Value>) {
        self.command(BridgeCommand::SendCustom {
            subtype: subtype.into(),
            data,
        });
    }

    /// Announces a created object to every client.
    pub fn broadcast_create(&self, object: ObjectState) {
        self.command(BridgeCommand::BroadcastCreate(object));
    }

    /// Announces a changed object to every client.
    pub fn broadcast_update(&self, object: ObjectState) {
        self.command(BridgeCommand::BroadcastUpdate(object));
    }

    /// Calls an RPC on the host. The result arrives as `NetEvent::RpcResolved`.
    pub fn call_rpc(&mut self, name: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> RpcTicket {
        self.last_ticket += 1;
        let ticket = RpcTicket(self.last_ticket);
        self.command(BridgeCommand::CallRpc {
            ticket,
            name: name.into(),
            args,
            kwargs,
        });
        ticket
    }

    /// Registers an RPC handler for when this bridge hosts.
    ///
    /// The handler runs on the network thread.
    pub fn register_rpc<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(RpcArgs) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.command(BridgeCommand::RegisterRpc {
            name: name.into(),
            handler: Arc::new(handler),
        });
    }

    /// Sets the snapshot source for state broadcasts.
    ///
    /// Runs on the network thread; read only snapshot-safe data.
    pub fn set_state_provider<F>(&self, provider: F)
    where
        F: Fn() -> Vec<ObjectState> + Send + Sync + 'static,
    {
        self.command(BridgeCommand::SetStateProvider(Arc::new(provider)));
    }

    /// Broadcasts whatever is published to `cell`.
    pub fn share_snapshots(&self, cell: &SnapshotCell) {
        self.set_state_provider(cell.provider());
    }

    /// Runs `command` on the network thread after `delay`.
    pub fn send_after(&self, delay: Duration, command: BridgeCommand) {
        self.command(BridgeCommand::SendAfter {
            delay,
            command: Box::new(command),
        });
    }

    /// Stops hosting or closes the client connection.
    pub fn disconnect(&self) {
        self.command(BridgeCommand::Disconnect);
    }

    /// Drains every queued event into `sim`, then hands it the frame delta
    /// through [`Simulation::on_frame`]. Never blocks.
    ///
    /// Returns the number of events applied.
    pub fn update<S: Simulation + ?Sized>(&mut self, dt: Duration, sim: &mut S) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events.try_recv() {
            event.apply(sim);
            applied += 1;
        }
        sim.on_frame(dt, applied);
        applied
    }

    /// Drains every queued event without applying it.
    pub fn drain_events(&mut self) -> Vec<NetEvent> {
        self.events.try_iter().collect()
    }

    /// Stops the network thread and waits for it.
    ///
    /// # Errors
    ///
    /// `Bridge` if the network thread panicked.
    pub fn shutdown(&mut self) -> NetResult<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.command(BridgeCommand::Shutdown);
        thread
            .join()
            .map_err(|_| NetError::Bridge("network thread panicked".to_string()))
    }
}

impl Drop for NetworkBridge {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "bridge shutdown failed");
        }
    }
}
