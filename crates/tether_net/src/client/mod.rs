//! # Client Engine
//!
//! Polled, non-blocking connection to a host.
//!
//! ## Design
//!
//! - Nothing here blocks for long: reads return what is available, writes
//!   are bounded by `write_timeout`
//! - RPC results are folded into the pending table during `poll`, never
//!   surfaced as messages
//! - Host pings are answered inside `poll`
//! - Any transport failure ends the session; there is no reconnect

mod rpc;

pub use rpc::{PendingCalls, RpcStatus};

use std::time::Duration;

use serde_json::{Map, Value};
use tether_shared::PROTOCOL_VERSION;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{NetError, NetResult};
use crate::protocol::{now, sign, ConnectionId, Message, RejectReason, RpcId, SpawnSpec};

/// Client connection state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientState {
    /// No stream.
    #[default]
    Disconnected,
    /// Stream open, `hello` sent, waiting for `welcome`.
    Connecting,
    /// Welcomed by the host.
    Connected,
}

/// Synchronous client endpoint.
#[derive(Debug)]
pub struct ClientEngine {
    config: ClientConfig,
    conn: Option<Connection>,
    state: ClientState,
    client_id: Option<ConnectionId>,
    rejection: Option<RejectReason>,
    rtt: Option<Duration>,
    calls: PendingCalls,
}

impl ClientEngine {
    /// Creates a disconnected client.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            conn: None,
            state: ClientState::Disconnected,
            client_id: None,
            rejection: None,
            rtt: None,
            calls: PendingCalls::new(),
        }
    }

    /// Connects to the host named in the configuration.
    ///
    /// # Errors
    ///
    /// As [`ClientEngine::connect`].
    pub fn connect_configured(&mut self) -> NetResult<()> {
        let host = self.config.host.clone();
        self.connect(&host, self.config.port, self.config.connect_timeout())
    }

    /// Opens the stream and sends `hello`. No-op unless disconnected.
    ///
    /// # Errors
    ///
    /// `Io` if the host is unreachable within `timeout`, or any send error
    /// for the `hello` frame.
    pub fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> NetResult<()> {
        if self.state != ClientState::Disconnected {
            return Ok(());
        }
        self.state = ClientState::Connecting;
        self.client_id = None;
        self.rejection = None;
        self.rtt = None;

        let conn = match Connection::connect(
            host,
            port,
            timeout,
            self.config.write_timeout(),
            self.config.max_frame_bytes,
        ) {
            Ok(conn) => conn,
            Err(e) => {
                self.state = ClientState::Disconnected;
                return Err(e);
            }
        };
        info!(peer = %conn.peer_addr(), "connected, sending hello");
        self.conn = Some(conn);

        let hello = Message::Hello {
            proto: PROTOCOL_VERSION.to_string(),
            token: self.config.secret.as_deref().map(sign),
        };
        self.send(&hello)
    }

    /// Encodes and writes one message.
    ///
    /// # Errors
    ///
    /// `NotConnected` without a stream; on a transport error the client
    /// disconnects and the error is returned.
    pub fn send(&mut self, msg: &Message) -> NetResult<()> {
        let conn = self.conn.as_mut().ok_or(NetError::NotConnected)?;
        if let Err(e) = conn.send(msg, false) {
            warn!(kind = msg.kind(), error = %e, "send failed, disconnecting");
            self.close();
            return Err(e);
        }
        Ok(())
    }

    /// Sends an `rpc` request and tracks it.
    ///
    /// Returns [`RpcId::INVALID`] until welcomed, or if the send failed.
    pub fn call_rpc(&mut self, name: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> RpcId {
        if self.state != ClientState::Connected {
            return RpcId::INVALID;
        }
        let id = self.calls.next_id();
        let request = Message::Rpc {
            id,
            name: name.to_string(),
            args,
            kwargs,
        };
        if self.send(&request).is_err() {
            return RpcId::INVALID;
        }
        self.calls.insert(id, name);
        id
    }

    /// Status of a call made with [`ClientEngine::call_rpc`].
    #[must_use]
    pub fn get_rpc_result(&self, id: RpcId) -> Option<RpcStatus> {
        self.calls.get(id).cloned()
    }

    /// Removes a finished call from the table.
    pub fn take_rpc_result(&mut self, id: RpcId) -> Option<RpcStatus> {
        self.calls.take(id)
    }

    /// Calls still waiting for a result.
    #[must_use]
    pub fn outstanding_rpcs(&self) -> usize {
        self.calls.outstanding()
    }

    /// Drains everything that has arrived, in receipt order.
    ///
    /// `rpc_result` frames update the pending table and are not returned.
    pub fn poll(&mut self) -> Vec<Message> {
        let Some(conn) = self.conn.as_mut() else {
            return Vec::new();
        };
        let incoming = match conn.read_messages() {
            Ok(messages) => messages,
            Err(e) => {
                info!(reason = %e, "connection lost");
                self.close();
                return Vec::new();
            }
        };

        let mut surfaced = Vec::with_capacity(incoming.len());
        for msg in incoming {
            match msg {
                Message::RpcResult {
                    id, ok, result, error, ..
                } => {
                    if !self.calls.resolve(id, ok, result, error) {
                        debug!(rpc = id.0, "result for unknown call");
                    }
                }
                msg => {
                    self.observe(&msg);
                    surfaced.push(msg);
                }
            }
        }
        surfaced
    }

    fn observe(&mut self, msg: &Message) {
        match *msg {
            Message::Welcome { client_id, .. } => {
                info!(client = client_id.0, "welcomed by host");
                self.client_id = Some(client_id);
                self.state = ClientState::Connected;
            }
            Message::Error { reason } => {
                warn!(%reason, "host rejected handshake");
                self.rejection = Some(reason);
                self.close();
            }
            Message::Ping { t } => {
                let _ = self.send(&Message::Pong { t, srv: now() });
            }
            Message::Pong { t, .. } => {
                self.rtt = Some(Duration::from_millis(now().saturating_sub(t)));
            }
            _ => {}
        }
    }

    /// Closes the stream and forgets pending calls. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
            debug!("client closed");
        }
        self.state = ClientState::Disconnected;
        self.calls.clear();
    }

    /// Sends a chat line.
    ///
    /// # Errors
    ///
    /// As [`ClientEngine::send`].
    pub fn send_chat(&mut self, text: impl Into<String>) -> NetResult<()> {
        self.send(&Message::Chat {
            from: None,
            text: text.into(),
        })
    }

    /// Sends an input payload stamped with the local clock.
    ///
    /// # Errors
    ///
    /// As [`ClientEngine::send`].
    pub fn send_input(&mut self, payload: Value) -> NetResult<()> {
        self.send(&Message::Input { payload, ts: now() })
    }

    /// Sends a spawn request.
    ///
    /// # Errors
    ///
    /// As [`ClientEngine::send`].
    pub fn send_spawn(&mut self, spec: SpawnSpec) -> NetResult<()> {
        self.send(&Message::Spawn(spec))
    }

    /// Sends an application-defined message.
    ///
    /// # Errors
    ///
    /// As [`ClientEngine::send`].
    pub fn send_custom(&mut self, subtype: impl Into<String>, data: Map<String, Value>) -> NetResult<()> {
        self.send(&Message::Custom {
            subtype: subtype.into(),
            from: None,
            data,
        })
    }

    /// Sends an RTT probe; the answer updates [`ClientEngine::rtt`].
    ///
    /// # Errors
    ///
    /// As [`ClientEngine::send`].
    pub fn ping(&mut self) -> NetResult<()> {
        self.send(&Message::Ping { t: now() })
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ClientState {
        self.state
    }

    /// Identifier assigned by the host, once welcomed.
    #[must_use]
    pub const fn client_id(&self) -> Option<ConnectionId> {
        self.client_id
    }

    /// Last measured round trip.
    #[must_use]
    pub const fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    /// Why the host refused the last handshake.
    #[must_use]
    pub const fn rejection(&self) -> Option<RejectReason> {
        self.rejection
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }
}
