//! # Host Engine
//!
//! The authoritative side of a session.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       HOST ENGINE                         │
//! ├───────────────────────────────────────────────────────────┤
//! │  accept task ──> per-peer receive task ──> dispatch       │
//! │                        │                     │            │
//! │                        ▼                     ▼            │
//! │               SessionRegistry (Mutex)   hooks / RPC       │
//! │                        │                                  │
//! │  tick task ──> ping idle peers, pull snapshot, broadcast  │
//! │                        │                                  │
//! │                        ▼                                  │
//! │               per-peer writer task (unbounded queue)      │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Rules
//!
//! - The registry lock is never held across an `.await` or a callback
//! - Every connection fires `on_disconnect` exactly once
//! - Callback and handler failures never take the host down

mod hooks;
mod peer;
mod registry;
mod rpc;
mod tick;

pub use crate::protocol::ConnectionId;
pub use hooks::HookResult;
pub use registry::{Frame, Peer, SessionRegistry};
pub use rpc::{dispatch, invoke, RpcArgs, RpcHandler, RpcRegistry, UNKNOWN_RPC};
pub use tick::{TickSchedule, TickStats};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tether_shared::{ObjectState, PROTOCOL_VERSION};
use tokio::net::{lookup_host, TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::hooks::{guarded, snapshot, Hooks};
use crate::config::HostConfig;
use crate::error::{HandlerError, NetError, NetResult};
use crate::protocol::{encode, now, Message, RejectReason, SpawnSpec};

const MIN_TICK_PERIOD: Duration = Duration::from_millis(1);

pub(crate) struct HostShared {
    config: HostConfig,
    registry: Mutex<SessionRegistry>,
    rpc: RwLock<RpcRegistry>,
    hooks: RwLock<Hooks>,
    schedule: Mutex<TickSchedule>,
    shutdown: CancellationToken,
    running: AtomicBool,
    stopped: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HostShared {
    fn compresses(&self, msg: &Message) -> bool {
        self.config.compress && matches!(msg, Message::State { .. } | Message::InitState { .. })
    }

    fn frame(&self, msg: &Message) -> Option<Frame> {
        match encode(msg, self.compresses(msg)) {
            Ok(bytes) => Some(Frame::from(bytes)),
            Err(e) => {
                warn!(kind = msg.kind(), error = %e, "failed to encode message");
                None
            }
        }
    }

    /// Capacity check and registration under one lock.
    ///
    /// `Err(None)` means the host is shutting down and the socket should be
    /// closed without a reply.
    fn admit(&self, peer: Peer, verdict: Result<(), RejectReason>) -> Result<ConnectionId, Option<RejectReason>> {
        let mut registry = self.registry.lock();
        if self.shutdown.is_cancelled() {
            return Err(None);
        }
        if registry.is_full(self.config.max_clients) {
            return Err(Some(RejectReason::Full));
        }
        verdict.map_err(Some)?;

        let id = registry.insert(peer);
        let welcome = Message::Welcome {
            client_id: id,
            server_time: now(),
            proto: PROTOCOL_VERSION.to_string(),
        };
        if let Some(frame) = self.frame(&welcome) {
            registry.send_to(id, &frame);
        }
        Ok(id)
    }

    fn on_established(&self, id: ConnectionId) {
        let hooks = self.hooks.read().clone();
        if self.config.send_initial_state {
            if let Some(objects) = hooks.state_provider.as_ref().and_then(snapshot) {
                self.send_to(id, &Message::InitState { objects });
            }
        }
        if let Some(hook) = hooks.client {
            guarded("on_client", || hook(id));
        }
    }

    fn touch(&self, id: ConnectionId) {
        self.registry.lock().touch(id);
    }

    fn drop_peer(&self, id: ConnectionId, why: &str) {
        let removed = self.registry.lock().remove(id);
        if removed.is_some() {
            self.fire_disconnect(id, why);
        }
    }

    fn fire_disconnect(&self, id: ConnectionId, why: &str) {
        info!(client = id.0, reason = why, "client disconnected");
        let hook = self.hooks.read().disconnect.clone();
        if let Some(hook) = hook {
            guarded("on_disconnect", || hook(id));
        }
    }

    fn prune(&self, dead: Vec<ConnectionId>) {
        for id in dead {
            self.drop_peer(id, "send failed");
        }
    }

    fn send_to(&self, id: ConnectionId, msg: &Message) -> bool {
        let Some(frame) = self.frame(msg) else {
            return false;
        };
        let sent = self.registry.lock().send_to(id, &frame);
        if !sent {
            self.drop_peer(id, "send failed");
        }
        sent
    }

    fn broadcast(&self, msg: &Message, exclude: Option<ConnectionId>) -> usize {
        let Some(frame) = self.frame(msg) else {
            return 0;
        };
        let (delivered, dead) = self.registry.lock().broadcast(&frame, exclude);
        self.prune(dead);
        delivered
    }

    fn broadcast_room(&self, room: &str, msg: &Message, exclude: Option<ConnectionId>) -> usize {
        let Some(frame) = self.frame(msg) else {
            return 0;
        };
        let (delivered, dead) = self.registry.lock().broadcast_room(room, &frame, exclude);
        self.prune(dead);
        delivered
    }

    fn dispatch(&self, id: ConnectionId, msg: Message) {
        match msg {
            Message::Ping { t } => {
                self.send_to(id, &Message::Pong { t, srv: now() });
            }
            Message::Pong { t, .. } => {
                let rtt = Duration::from_millis(now().saturating_sub(t));
                self.registry.lock().set_rtt(id, rtt);
            }
            Message::Input { payload, ts } => {
                let hook = self.hooks.read().input.clone();
                if let Some(hook) = hook {
                    guarded("on_input", || hook(id, &payload, ts));
                }
            }
            Message::Chat { text, .. } => {
                self.broadcast(
                    &Message::Chat {
                        from: Some(id),
                        text: text.clone(),
                    },
                    None,
                );
                let hook = self.hooks.read().chat.clone();
                if let Some(hook) = hook {
                    guarded("on_chat", || hook(id, &text));
                }
            }
            Message::Spawn(mut spec) => {
                spec.from = Some(id);
                let exclude = (!self.config.echo_spawn_to_sender).then_some(id);
                self.broadcast(&Message::Spawn(spec.clone()), exclude);
                let hook = self.hooks.read().spawn.clone();
                if let Some(hook) = hook {
                    guarded("on_spawn", || hook(id, &spec));
                }
            }
            Message::Custom { subtype, data, .. } => {
                let hook = self.hooks.read().custom.clone();
                if let Some(hook) = hook {
                    guarded("on_custom", || hook(id, &subtype, &data));
                }
            }
            Message::Rpc {
                id: call_id,
                name,
                args,
                kwargs,
            } => {
                let handler = self.rpc.read().get(&name);
                let call = RpcArgs {
                    caller: id,
                    args,
                    kwargs,
                };
                let reply = match rpc::dispatch(handler.as_ref(), call) {
                    Ok(result) => Message::rpc_ok(call_id, name, result),
                    Err(error) => {
                        warn!(rpc = %name, %error, "rpc failed");
                        Message::rpc_err(call_id, name, error)
                    }
                };
                self.send_to(id, &reply);
            }
            other => debug!(kind = other.kind(), "ignoring unexpected message"),
        }
    }

    fn tick(&self) {
        let start = Instant::now();

        let mut pings = 0;
        if let Some(ping) = peer::ping_frame() {
            let (sent, dead) = self
                .registry
                .lock()
                .ping_idle(&ping, self.config.ping_interval(), start);
            pings = sent;
            self.prune(dead);
        }

        let mut broadcast = false;
        if self.schedule.lock().broadcast_due(start) {
            let provider = self.hooks.read().state_provider.clone();
            if let Some(objects) = provider.as_ref().and_then(snapshot) {
                self.broadcast(&Message::State { objects, ts: now() }, None);
                broadcast = true;
            }
        }

        self.schedule.lock().record(start, pings, broadcast);
    }
}

async fn accept_loop(shared: Arc<HostShared>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                debug!(%addr, "accepted connection");
                tokio::spawn(peer::serve(Arc::clone(&shared), stream, addr));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    debug!("listener closed");
}

async fn tick_loop(shared: Arc<HostShared>) {
    let period = shared
        .config
        .broadcast_interval()
        .min(shared.config.ping_interval())
        .max(MIN_TICK_PERIOD);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => shared.tick(),
        }
    }
}

/// Authoritative host. Cheap to clone; clones share one session.
///
/// Must be started from inside a tokio runtime.
#[derive(Clone)]
pub struct HostEngine {
    shared: Arc<HostShared>,
}

impl std::fmt::Debug for HostEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostEngine")
            .field("local_addr", &self.local_addr())
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}

impl HostEngine {
    /// Creates a stopped host.
    ///
    /// # Errors
    ///
    /// Returns `NetError::InvalidConfig` if `config` fails validation.
    pub fn new(config: HostConfig) -> NetResult<Self> {
        config.validate()?;
        let schedule = TickSchedule::new(config.broadcast_interval());
        Ok(Self {
            shared: Arc::new(HostShared {
                config,
                registry: Mutex::new(SessionRegistry::new()),
                rpc: RwLock::new(RpcRegistry::new()),
                hooks: RwLock::new(Hooks::default()),
                schedule: Mutex::new(schedule),
                shutdown: CancellationToken::new(),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                local_addr: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &HostConfig {
        &self.shared.config
    }

    /// Registers an RPC handler, replacing any previous one with that name.
    pub fn register_rpc<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(RpcArgs) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.shared.rpc.write().register(name, handler);
    }

    /// Removes an RPC handler.
    pub fn unregister_rpc(&self, name: &str) -> bool {
        self.shared.rpc.write().unregister(name)
    }

    /// Called once a client is welcomed.
    pub fn on_client<F>(&self, f: F)
    where
        F: Fn(ConnectionId) -> HookResult + Send + Sync + 'static,
    {
        self.shared.hooks.write().client = Some(Arc::new(f));
    }

    /// Called exactly once per welcomed client when it goes away.
    pub fn on_disconnect<F>(&self, f: F)
    where
        F: Fn(ConnectionId) -> HookResult + Send + Sync + 'static,
    {
        self.shared.hooks.write().disconnect = Some(Arc::new(f));
    }

    /// Called for every `input` frame with its payload and timestamp.
    pub fn on_input<F>(&self, f: F)
    where
        F: Fn(ConnectionId, &Value, u64) -> HookResult + Send + Sync + 'static,
    {
        self.shared.hooks.write().input = Some(Arc::new(f));
    }

    /// Called for every `chat` frame after it was rebroadcast.
    pub fn on_chat<F>(&self, f: F)
    where
        F: Fn(ConnectionId, &str) -> HookResult + Send + Sync + 'static,
    {
        self.shared.hooks.write().chat = Some(Arc::new(f));
    }

    /// Called for every `spawn` frame after it was rebroadcast.
    pub fn on_spawn<F>(&self, f: F)
    where
        F: Fn(ConnectionId, &SpawnSpec) -> HookResult + Send + Sync + 'static,
    {
        self.shared.hooks.write().spawn = Some(Arc::new(f));
    }

    /// Called for every `custom` frame with its subtype and body.
    pub fn on_custom<F>(&self, f: F)
    where
        F: Fn(ConnectionId, &str, &Map<String, Value>) -> HookResult + Send + Sync + 'static,
    {
        self.shared.hooks.write().custom = Some(Arc::new(f));
    }

    /// Sets the snapshot source for `state` and `init_state`.
    ///
    /// Runs on the network scheduler; it must only read data that is safe to
    /// read from there.
    pub fn set_state_provider<F>(&self, f: F)
    where
        F: Fn() -> Vec<ObjectState> + Send + Sync + 'static,
    {
        self.shared.hooks.write().state_provider = Some(Arc::new(f));
    }

    /// Stops state broadcasts.
    pub fn clear_state_provider(&self) {
        self.shared.hooks.write().state_provider = None;
    }

    /// Binds the listener and spawns the accept and tick tasks.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if started before (a stopped host cannot restart),
    /// `Io` or `InvalidConfig` if the address cannot be bound.
    pub async fn start(&self) -> NetResult<SocketAddr> {
        if self.shared.stopped.load(Ordering::SeqCst) || self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(NetError::AlreadyRunning);
        }
        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let addr = listener.local_addr()?;
        *self.shared.local_addr.lock() = Some(addr);

        let accept = tokio::spawn(accept_loop(Arc::clone(&self.shared), listener));
        let tick = tokio::spawn(tick_loop(Arc::clone(&self.shared)));
        self.shared.tasks.lock().extend([accept, tick]);

        info!(%addr, max_clients = self.shared.config.max_clients, "host listening");
        Ok(addr)
    }

    async fn bind(&self) -> NetResult<TcpListener> {
        let bind_addr = self.shared.config.bind_addr();
        let addr = lookup_host(&bind_addr)
            .await?
            .next()
            .ok_or_else(|| NetError::InvalidConfig(format!("cannot resolve {bind_addr}")))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        Ok(socket.listen(self.shared.config.backlog)?)
    }

    /// Closes every connection, releases the listener and stops the tick.
    ///
    /// Safe to call repeatedly or on a host that never started.
    pub async fn shutdown(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.shutdown.cancel();

        let ids = self.shared.registry.lock().remove_all();
        for id in ids {
            self.shared.fire_disconnect(id, "host shutdown");
        }

        let tasks = std::mem::take(&mut *self.shared.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        self.shared.running.store(false, Ordering::SeqCst);
        *self.shared.local_addr.lock() = None;
        info!("host stopped");
    }

    /// Runs one tick pass now, outside the periodic schedule.
    pub fn tick(&self) {
        self.shared.tick();
    }

    /// Sends to every client except `exclude`. Returns the delivery count.
    pub fn broadcast(&self, msg: &Message, exclude: Option<ConnectionId>) -> usize {
        self.shared.broadcast(msg, exclude)
    }

    /// Sends to every member of `room` except `exclude`.
    pub fn broadcast_room(&self, room: &str, msg: &Message, exclude: Option<ConnectionId>) -> usize {
        self.shared.broadcast_room(room, msg, exclude)
    }

    /// Sends to one client; a failed send drops it.
    pub fn send_to(&self, id: ConnectionId, msg: &Message) -> bool {
        self.shared.send_to(id, msg)
    }

    /// Broadcasts a host-authored spawn (no `from`).
    pub fn broadcast_spawn(&self, spec: SpawnSpec) -> usize {
        self.shared.broadcast(&Message::Spawn(SpawnSpec { from: None, ..spec }), None)
    }

    /// Announces a new object to every client.
    pub fn broadcast_create(&self, object: ObjectState) -> usize {
        self.shared.broadcast(&Message::Create { object }, None)
    }

    /// Announces a changed object to every client.
    pub fn broadcast_update(&self, object: ObjectState) -> usize {
        self.shared.broadcast(&Message::Update { object }, None)
    }

    /// Adds a client to a room. False if `id` is not connected.
    pub fn join_room(&self, id: ConnectionId, room: &str) -> bool {
        self.shared.registry.lock().join_room(id, room)
    }

    /// Removes a client from a room.
    pub fn leave_room(&self, id: ConnectionId, room: &str) -> bool {
        self.shared.registry.lock().leave_room(id, room)
    }

    /// Current members of `room`.
    #[must_use]
    pub fn room_members(&self, room: &str) -> Vec<ConnectionId> {
        self.shared.registry.lock().room_members(room)
    }

    /// Number of established clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.shared.registry.lock().len()
    }

    /// Established client identifiers, ascending.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.shared.registry.lock().ids()
    }

    /// Last round trip measured for a client.
    #[must_use]
    pub fn rtt(&self, id: ConnectionId) -> Option<Duration> {
        self.shared.registry.lock().get(id).and_then(Peer::rtt)
    }

    /// Bound address while running.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    /// Returns true between `start` and `shutdown`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Tick statistics so far.
    #[must_use]
    pub fn tick_stats(&self) -> TickStats {
        self.shared.schedule.lock().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_validates_config() {
        let config = HostConfig {
            max_clients: 0,
            ..HostConfig::local()
        };
        assert!(matches!(HostEngine::new(config), Err(NetError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_start_twice_and_restart() {
        let host = HostEngine::new(HostConfig::local()).unwrap();
        let addr = host.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(host.is_running());
        assert_eq!(host.local_addr(), Some(addr));
        assert!(matches!(host.start().await, Err(NetError::AlreadyRunning)));

        host.shutdown().await;
        host.shutdown().await;
        assert!(!host.is_running());
        assert!(host.local_addr().is_none());
        assert!(matches!(host.start().await, Err(NetError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn test_shutdown_releases_listener() {
        let host = HostEngine::new(HostConfig::local()).unwrap();
        let addr = host.start().await.unwrap();
        host.shutdown().await;

        let again = HostEngine::new(HostConfig {
            port: addr.port(),
            ..HostConfig::local()
        })
        .unwrap();
        assert_eq!(again.start().await.unwrap().port(), addr.port());
        again.shutdown().await;
    }

    #[test]
    fn test_shutdown_without_start() {
        let host = HostEngine::new(HostConfig::local()).unwrap();
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(host.shutdown());
        assert!(!host.is_running());
    }

    #[test]
    fn test_tick_without_clients_counts_broadcast() {
        let host = HostEngine::new(HostConfig::local()).unwrap();
        host.set_state_provider(Vec::new);
        host.tick();
        host.tick();
        let stats = host.tick_stats();
        assert_eq!(stats.ticks, 2);
        assert_eq!(stats.broadcasts, 1);
        assert_eq!(stats.pings_sent, 0);
    }

    #[test]
    fn test_room_calls_require_registration() {
        let host = HostEngine::new(HostConfig::local()).unwrap();
        assert!(!host.join_room(ConnectionId(1), "red"));
        assert!(host.room_members("red").is_empty());
        assert!(!host.send_to(ConnectionId(1), &Message::Ping { t: 0 }));
        assert_eq!(host.broadcast(&Message::Ping { t: 0 }, None), 0);
    }
}
