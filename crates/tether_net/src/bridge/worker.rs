//! Network-thread side of the bridge.
//!
//! One command loop owns whichever engine is active. The client engine is
//! polled from the same loop, so it never needs a lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam_channel::Sender;
use serde_json::{Map, Value};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::events::{NetEvent, NetStatus, RpcTicket};
use super::BridgeCommand;
use crate::client::{ClientEngine, ClientState, RpcStatus};
use crate::config::{ClientConfig, HostConfig};
use crate::error::{HandlerError, NetResult};
use crate::host::{HostEngine, RpcArgs};
use crate::protocol::{ConnectionId, Message, RpcId};
use tether_shared::ObjectState;

pub(super) type StateSource = Arc<dyn Fn() -> Vec<ObjectState> + Send + Sync>;
pub(super) type BridgeRpc = Arc<dyn Fn(RpcArgs) -> Result<Value, HandlerError> + Send + Sync>;

enum Role {
    Idle,
    Host(HostEngine),
    Client(ClientEngine),
}

pub(super) struct Worker {
    events: Sender<NetEvent>,
    loopback: UnboundedSender<BridgeCommand>,
    role: Role,
    provider: Option<StateSource>,
    rpcs: BTreeMap<String, BridgeRpc>,
    tickets: BTreeMap<RpcTicket, RpcId>,
    poll: Interval,
}

impl Worker {
    pub(super) fn new(events: Sender<NetEvent>, loopback: UnboundedSender<BridgeCommand>) -> Self {
        Self {
            events,
            loopback,
            role: Role::Idle,
            provider: None,
            rpcs: BTreeMap::new(),
            tickets: BTreeMap::new(),
            poll: poll_timer(&ClientConfig::default()),
        }
    }

    pub(super) async fn run(mut self, mut commands: UnboundedReceiver<BridgeCommand>) {
        info!("network thread started");
        loop {
            let polling = matches!(self.role, Role::Client(_));
            tokio::select! {
                command = commands.recv() => match command {
                    Some(BridgeCommand::Shutdown) | None => break,
                    Some(command) => self.handle(command).await,
                },
                _ = self.poll.tick(), if polling => self.poll_client(),
            }
        }
        self.stop().await;
        info!("network thread stopped");
    }

    fn emit(&self, event: NetEvent) {
        if self.events.send(event).is_err() {
            debug!("simulation side dropped the event queue");
        }
    }

    fn status(&self, status: NetStatus) {
        self.emit(NetEvent::Status(status));
    }

    /// Surfaces a failed client send; the session itself ends on the next poll.
    fn report(&self, kind: &str, sent: NetResult<()>) {
        if let Err(e) = sent {
            self.status(NetStatus::Error(format!("{kind} not sent: {e}")));
        }
    }

    async fn handle(&mut self, command: BridgeCommand) {
        match command {
            BridgeCommand::StartHost(config) => self.start_host(config).await,
            BridgeCommand::Connect(config) => self.connect(config).await,
            BridgeCommand::SendChat(text) => match &mut self.role {
                Role::Host(host) => {
                    host.broadcast(&Message::Chat { from: None, text }, None);
                }
                Role::Client(client) => {
                    let sent = client.send_chat(text);
                    self.report("chat", sent);
                }
                Role::Idle => debug!("chat dropped, not connected"),
            },
            BridgeCommand::BroadcastSpawn(spec) => match &mut self.role {
                Role::Host(host) => {
                    host.broadcast_spawn(spec);
                }
                Role::Client(client) => {
                    let sent = client.send_spawn(spec);
                    self.report("spawn", sent);
                }
                Role::Idle => debug!("spawn dropped, not connected"),
            },
            BridgeCommand::SendInput(payload) => match &mut self.role {
                Role::Client(client) => {
                    let sent = client.send_input(payload);
                    self.report("input", sent);
                }
                _ => debug!("input only travels client to host"),
            },
            BridgeCommand::SendCustom { subtype, data } => match &mut self.role {
                Role::Host(host) => {
                    host.broadcast(
                        &Message::Custom {
                            subtype,
                            from: None,
                            data,
                        },
                        None,
                    );
                }
                Role::Client(client) => {
                    let sent = client.send_custom(subtype, data);
                    self.report("custom", sent);
                }
                Role::Idle => debug!("custom message dropped, not connected"),
            },
            BridgeCommand::BroadcastCreate(object) => {
                if let Role::Host(host) = &self.role {
                    host.broadcast_create(object);
                }
            }
            BridgeCommand::BroadcastUpdate(object) => {
                if let Role::Host(host) = &self.role {
                    host.broadcast_update(object);
                }
            }
            BridgeCommand::CallRpc {
                ticket,
                name,
                args,
                kwargs,
            } => self.call_rpc(ticket, name, args, kwargs),
            BridgeCommand::RegisterRpc { name, handler } => {
                if let Role::Host(host) = &self.role {
                    let handler = Arc::clone(&handler);
                    host.register_rpc(name.clone(), move |call| handler(call));
                }
                self.rpcs.insert(name, handler);
            }
            BridgeCommand::SetStateProvider(provider) => {
                if let Role::Host(host) = &self.role {
                    let source = Arc::clone(&provider);
                    host.set_state_provider(move || source());
                }
                self.provider = Some(provider);
            }
            BridgeCommand::SendAfter { delay, command } => {
                let loopback = self.loopback.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = loopback.send(*command);
                });
            }
            BridgeCommand::Disconnect => self.stop().await,
            BridgeCommand::Shutdown => {}
        }
    }

    async fn start_host(&mut self, config: HostConfig) {
        if !matches!(self.role, Role::Idle) {
            self.status(NetStatus::Error("already hosting or connected".into()));
            return;
        }
        let host = match HostEngine::new(config) {
            Ok(host) => host,
            Err(e) => {
                self.status(NetStatus::Error(e.to_string()));
                return;
            }
        };
        self.wire_host(&host);

        match host.start().await {
            Ok(addr) => {
                self.role = Role::Host(host);
                self.status(NetStatus::Hosting { addr });
            }
            Err(e) => {
                warn!(error = %e, "host failed to start");
                self.status(NetStatus::Error(e.to_string()));
            }
        }
    }

    fn wire_host(&self, host: &HostEngine) {
        let events = self.events.clone();
        host.on_client(move |id| {
            let _ = events.send(NetEvent::ClientJoined(id));
            Ok(())
        });
        let events = self.events.clone();
        host.on_disconnect(move |id| {
            let _ = events.send(NetEvent::ClientLeft(id));
            Ok(())
        });
        let events = self.events.clone();
        host.on_input(move |from, payload, ts| {
            let _ = events.send(NetEvent::Input {
                from,
                payload: payload.clone(),
                ts,
            });
            Ok(())
        });
        let events = self.events.clone();
        host.on_chat(move |from, text| {
            let _ = events.send(NetEvent::Chat {
                from: Some(from),
                text: text.to_string(),
            });
            Ok(())
        });
        let events = self.events.clone();
        host.on_spawn(move |_, spec| {
            let _ = events.send(NetEvent::Spawn(spec.clone()));
            Ok(())
        });
        let events = self.events.clone();
        host.on_custom(move |from, subtype, data| {
            let _ = events.send(NetEvent::Custom {
                from: Some(from),
                subtype: subtype.to_string(),
                data: data.clone(),
            });
            Ok(())
        });

        for (name, handler) in &self.rpcs {
            let handler = Arc::clone(handler);
            host.register_rpc(name.clone(), move |call| handler(call));
        }
        if let Some(provider) = &self.provider {
            let source = Arc::clone(provider);
            host.set_state_provider(move || source());
        }
    }

    async fn connect(&mut self, config: ClientConfig) {
        if !matches!(self.role, Role::Idle) {
            self.status(NetStatus::Error("already hosting or connected".into()));
            return;
        }
        self.status(NetStatus::Connecting);
        self.poll = poll_timer(&config);

        let attempt = tokio::task::spawn_blocking(move || {
            let mut client = ClientEngine::new(config);
            client.connect_configured().map(|()| client)
        })
        .await;

        match attempt {
            Ok(Ok(client)) => self.role = Role::Client(client),
            Ok(Err(e)) => {
                warn!(error = %e, "connect failed");
                self.status(NetStatus::Error(e.to_string()));
                self.status(NetStatus::Disconnected);
            }
            Err(e) => self.status(NetStatus::Error(e.to_string())),
        }
    }

    fn call_rpc(&mut self, ticket: RpcTicket, name: String, args: Vec<Value>, kwargs: Map<String, Value>) {
        let Role::Client(client) = &mut self.role else {
            self.resolve_failed(ticket, name, "not_connected");
            return;
        };
        let id = client.call_rpc(&name, args, kwargs);
        if id.is_valid() {
            self.tickets.insert(ticket, id);
        } else {
            self.resolve_failed(ticket, name, "not_connected");
        }
    }

    fn resolve_failed(&self, ticket: RpcTicket, name: String, error: &str) {
        self.emit(NetEvent::RpcResolved {
            ticket,
            status: RpcStatus {
                done: true,
                ok: false,
                result: Value::Null,
                error: Some(error.to_string()),
                name,
            },
        });
    }

    fn poll_client(&mut self) {
        let Role::Client(client) = &mut self.role else {
            return;
        };
        let messages = client.poll();
        let own_id = client.client_id();

        // A dropped connection clears the client's table; those calls are lost.
        let mut resolved = Vec::new();
        let mut lost = Vec::new();
        self.tickets.retain(|&ticket, &mut id| match client.get_rpc_result(id) {
            Some(status) if status.done => {
                client.take_rpc_result(id);
                resolved.push((ticket, status));
                false
            }
            Some(_) => true,
            None => {
                lost.push(ticket);
                false
            }
        });
        let state = client.state();
        let rejection = client.rejection();

        for msg in messages {
            if let Some(event) = client_event(msg, own_id) {
                self.emit(event);
            }
        }
        for (ticket, status) in resolved {
            self.emit(NetEvent::RpcResolved { ticket, status });
        }
        for ticket in lost {
            self.resolve_failed(ticket, String::new(), "disconnected");
        }

        if state == ClientState::Disconnected {
            if let Some(reason) = rejection {
                self.status(NetStatus::Rejected(reason));
            }
            self.role = Role::Idle;
            self.fail_tickets();
            self.status(NetStatus::Disconnected);
        }
    }

    fn fail_tickets(&mut self) {
        for ticket in std::mem::take(&mut self.tickets).into_keys() {
            self.resolve_failed(ticket, String::new(), "disconnected");
        }
    }

    async fn stop(&mut self) {
        match std::mem::replace(&mut self.role, Role::Idle) {
            Role::Host(host) => {
                host.shutdown().await;
                self.status(NetStatus::HostStopped);
            }
            Role::Client(mut client) => {
                client.close();
                self.fail_tickets();
                self.status(NetStatus::Disconnected);
            }
            Role::Idle => {}
        }
    }
}

fn poll_timer(config: &ClientConfig) -> Interval {
    let mut timer = interval(config.poll_interval());
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

/// Maps a client-side message to a simulation event.
///
/// Spawns carrying our own id are echoes of something the simulation
/// already applied.
fn client_event(msg: Message, own_id: Option<ConnectionId>) -> Option<NetEvent> {
    let event = match msg {
        Message::Welcome { client_id, .. } => NetEvent::Status(NetStatus::Connected { client_id }),
        Message::Spawn(spec) => {
            if spec.from.is_some() && spec.from == own_id {
                return None;
            }
            NetEvent::Spawn(spec)
        }
        Message::State { objects, ts } => NetEvent::State { objects, ts },
        Message::InitState { objects } => NetEvent::InitState(objects),
        Message::Create { object } => NetEvent::Create(object),
        Message::Update { object } => NetEvent::Update(object),
        Message::Custom { subtype, from, data } => NetEvent::Custom { from, subtype, data },
        Message::Chat { from, text } => NetEvent::Chat { from, text },
        _ => return None,
    };
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SpawnSpec;
    use tether_shared::Vec2;

    #[test]
    fn test_own_spawn_echo_is_dropped() {
        let own = Some(ConnectionId(2));
        let mine = SpawnSpec {
            from: Some(ConnectionId(2)),
            ..SpawnSpec::shape("box", Vec2::ZERO)
        };
        let theirs = SpawnSpec {
            from: Some(ConnectionId(3)),
            ..SpawnSpec::shape("box", Vec2::ZERO)
        };
        let hosts = SpawnSpec::shape("ball", Vec2::ZERO);

        assert!(client_event(Message::Spawn(mine), own).is_none());
        assert!(client_event(Message::Spawn(theirs), own).is_some());
        assert!(client_event(Message::Spawn(hosts.clone()), own).is_some());
        assert!(client_event(Message::Spawn(hosts), None).is_some());
    }

    #[tokio::test]
    async fn test_failed_send_is_reported() {
        let (events, inbox) = crossbeam_channel::unbounded();
        let (loopback, _commands) = tokio::sync::mpsc::unbounded_channel();
        let worker = Worker::new(events, loopback);

        worker.report("chat", Ok(()));
        assert!(inbox.try_recv().is_err());

        worker.report("chat", Err(crate::error::NetError::NotConnected));
        assert_eq!(
            inbox.try_recv().unwrap(),
            NetEvent::Status(NetStatus::Error("chat not sent: not connected".into()))
        );
    }

    #[test]
    fn test_keepalive_is_not_surfaced() {
        assert!(client_event(Message::Ping { t: 1 }, None).is_none());
        assert!(client_event(Message::Pong { t: 1, srv: 2 }, None).is_none());
        assert_eq!(
            client_event(
                Message::Welcome {
                    client_id: ConnectionId(5),
                    server_time: 0,
                    proto: "1.0".into()
                },
                None
            ),
            Some(NetEvent::Status(NetStatus::Connected {
                client_id: ConnectionId(5)
            }))
        );
    }
}
