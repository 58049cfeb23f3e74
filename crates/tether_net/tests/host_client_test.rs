//! # Host / Client Session Tests
//!
//! Runs a real host on loopback and drives polled clients against it:
//!
//! 1. **Handshake**: welcome, identifiers, auth and protocol rejection
//! 2. **Capacity**: the host never admits more than `max_clients`
//! 3. **RPC**: results, unknown names, failing and panicking handlers
//! 4. **Liveness**: inactivity eviction and shutdown
//! 5. **Fan-out**: chat, spawns, rooms and state snapshots
//!
//! Run with: cargo test -p tether_net --test host_client_test

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tether_net::{
    ClientConfig, ClientEngine, ClientState, Connection, ConnectionId, HandlerError, HostConfig, HostEngine,
    Message, NetError, ObjectState, RejectReason, RpcArgs, SpawnSpec, Vec2,
};

const WAIT: Duration = Duration::from_secs(3);
const STEP: Duration = Duration::from_millis(5);

// ============================================================================
// HELPERS
// ============================================================================

async fn start(config: HostConfig) -> (HostEngine, SocketAddr) {
    let host = HostEngine::new(config).unwrap();
    let addr = host.start().await.unwrap();
    (host, addr)
}

fn echo(call: RpcArgs) -> Result<Value, HandlerError> {
    Ok(call.arg(0).cloned().unwrap_or(Value::Null))
}

/// Polls `client` until `done` holds, keeping everything it returned.
async fn poll_until<F>(client: &mut ClientEngine, mut done: F) -> Vec<Message>
where
    F: FnMut(&ClientEngine, &[Message]) -> bool,
{
    let deadline = Instant::now() + WAIT;
    let mut seen = Vec::new();
    loop {
        seen.extend(client.poll());
        if done(client, &seen) || Instant::now() > deadline {
            return seen;
        }
        tokio::time::sleep(STEP).await;
    }
}

/// Yields to the host until `check` holds or the wait runs out.
async fn wait_for<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = Instant::now() + WAIT;
    while !check() {
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(STEP).await;
    }
    true
}

/// Connects and polls until the handshake settles, keeping what arrived.
async fn join_with_backlog(addr: SocketAddr, secret: Option<&str>) -> (ClientEngine, Vec<Message>) {
    let mut config = ClientConfig::new("127.0.0.1", addr.port());
    config.secret = secret.map(str::to_string);
    let mut client = ClientEngine::new(config);
    client.connect_configured().unwrap();
    let seen = poll_until(&mut client, |c, _| c.state() != ClientState::Connecting).await;
    (client, seen)
}

async fn join(addr: SocketAddr, secret: Option<&str>) -> ClientEngine {
    join_with_backlog(addr, secret).await.0
}

async fn call(client: &mut ClientEngine, name: &str, args: Vec<Value>) -> tether_net::RpcStatus {
    let id = client.call_rpc(name, args, Map::new());
    assert!(id.is_valid());
    poll_until(client, |c, _| c.get_rpc_result(id).is_some_and(|s| s.done)).await;
    client.take_rpc_result(id).unwrap()
}

fn chats(messages: &[Message]) -> Vec<(Option<ConnectionId>, String)> {
    messages
        .iter()
        .filter_map(|m| match m {
            Message::Chat { from, text } => Some((*from, text.clone())),
            _ => None,
        })
        .collect()
}

fn counter() -> (Arc<AtomicUsize>, impl Fn(ConnectionId) -> Result<(), HandlerError> + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let hook_count = Arc::clone(&count);
    (count, move |_: ConnectionId| {
        hook_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, fut).await.unwrap()
}

// ============================================================================
// HANDSHAKE
// ============================================================================

#[tokio::test]
async fn test_welcome_and_echo_rpc() {
    let (host, addr) = start(HostConfig::local()).await;
    host.register_rpc("echo", echo);

    let mut client = join(addr, None).await;
    assert_eq!(client.state(), ClientState::Connected);
    assert_eq!(client.client_id(), Some(ConnectionId(1)));
    assert!(wait_for(|| host.client_count() == 1).await);

    let id = client.call_rpc("echo", vec![json!("hi")], Map::new());
    assert_eq!(id.0, 1);
    assert_eq!(client.get_rpc_result(id).map(|s| s.done), Some(false));
    assert_eq!(client.outstanding_rpcs(), 1);
    poll_until(&mut client, |c, _| c.get_rpc_result(id).is_some_and(|s| s.done)).await;

    let status = client.take_rpc_result(id).unwrap();
    assert!(status.ok);
    assert_eq!(status.name, "echo");
    assert_eq!(status.result, json!("hi"));
    assert_eq!(client.outstanding_rpcs(), 0);

    client.close();
    host.shutdown().await;
}

#[tokio::test]
async fn test_identifiers_increase() {
    let (host, addr) = start(HostConfig::local()).await;

    let mut first = join(addr, None).await;
    let second = join(addr, None).await;
    first.close();
    assert!(wait_for(|| host.client_count() == 1).await);
    let third = join(addr, None).await;

    assert_eq!(second.client_id(), Some(ConnectionId(2)));
    assert_eq!(third.client_id(), Some(ConnectionId(3)));
    assert_eq!(host.connection_ids(), vec![ConnectionId(2), ConnectionId(3)]);

    host.shutdown().await;
}

#[tokio::test]
async fn test_secret_is_enforced() {
    let mut config = HostConfig::local();
    config.secret = Some("s3cret".into());
    let (host, addr) = start(config).await;
    let (joined, on_client) = counter();
    host.on_client(on_client);

    let missing = join(addr, None).await;
    assert_eq!(missing.state(), ClientState::Disconnected);
    assert_eq!(missing.rejection(), Some(RejectReason::Auth));

    let wrong = join(addr, Some("guess")).await;
    assert_eq!(wrong.rejection(), Some(RejectReason::Auth));
    assert_eq!(host.client_count(), 0);
    assert_eq!(joined.load(Ordering::SeqCst), 0);

    let right = join(addr, Some("s3cret")).await;
    assert_eq!(right.state(), ClientState::Connected);
    assert_eq!(right.client_id(), Some(ConnectionId(1)));
    assert!(wait_for(|| joined.load(Ordering::SeqCst) == 1).await);

    host.shutdown().await;
}

#[tokio::test]
async fn test_protocol_mismatch_is_rejected() {
    let (host, addr) = start(HostConfig::local()).await;

    let mut conn = Connection::connect(
        "127.0.0.1",
        addr.port(),
        Duration::from_secs(1),
        Duration::from_secs(1),
        1024,
    )
    .unwrap();
    conn.send(
        &Message::Hello {
            proto: "0.9".into(),
            token: None,
        },
        false,
    )
    .unwrap();

    let deadline = Instant::now() + WAIT;
    let mut received = Vec::new();
    let closed = loop {
        match conn.read_messages() {
            Ok(messages) => received.extend(messages),
            Err(NetError::ConnectionClosed) => break true,
            Err(_) => break false,
        }
        if Instant::now() > deadline {
            break false;
        }
        tokio::time::sleep(STEP).await;
    };

    assert!(closed);
    assert_eq!(received, vec![Message::Error { reason: RejectReason::Proto }]);
    assert_eq!(host.client_count(), 0);

    host.shutdown().await;
}

#[tokio::test]
async fn test_capacity_is_never_exceeded() {
    let mut config = HostConfig::local();
    config.max_clients = 2;
    let (host, addr) = start(config).await;

    let mut clients = Vec::new();
    for _ in 0..4 {
        let mut client = ClientEngine::new(ClientConfig::new("127.0.0.1", addr.port()));
        client.connect_configured().unwrap();
        clients.push(client);
    }
    for client in &mut clients {
        poll_until(client, |c, _| c.state() != ClientState::Connecting).await;
    }

    let connected = clients.iter().filter(|c| c.state() == ClientState::Connected).count();
    let full = clients
        .iter()
        .filter(|c| c.rejection() == Some(RejectReason::Full))
        .count();
    assert_eq!(connected, 2);
    assert_eq!(full, 2);
    assert_eq!(host.client_count(), 2);

    host.shutdown().await;
}

// ============================================================================
// RPC
// ============================================================================

#[tokio::test]
async fn test_failing_handlers_do_not_stop_the_host() {
    let (host, addr) = start(HostConfig::local()).await;
    host.register_rpc("echo", echo);
    host.register_rpc("boom", |_| Err(HandlerError::new("boom")));
    host.register_rpc("explode", |_| panic!("kaboom"));

    let mut client = join(addr, None).await;

    let unknown = call(&mut client, "nope", vec![]).await;
    assert!(!unknown.ok);
    assert_eq!(unknown.error.as_deref(), Some("unknown_rpc"));

    let failed = call(&mut client, "boom", vec![]).await;
    assert!(!failed.ok);
    assert_eq!(failed.error.as_deref(), Some("boom"));

    let panicked = call(&mut client, "explode", vec![]).await;
    assert!(!panicked.ok);
    assert!(panicked.error.unwrap_or_default().contains("kaboom"));

    assert!(host.is_running());
    assert_eq!(client.state(), ClientState::Connected);
    let fine = call(&mut client, "echo", vec![json!(7)]).await;
    assert!(fine.ok);

    host.shutdown().await;
}

#[tokio::test]
async fn test_rpc_sees_caller() {
    let (host, addr) = start(HostConfig::local()).await;
    host.register_rpc("whoami", |call: RpcArgs| {
        Ok(json!({ "caller": call.caller.0, "team": call.kwarg("team") }))
    });

    let _first = join(addr, None).await;
    let mut second = join(addr, None).await;
    let mut kwargs = Map::new();
    kwargs.insert("team".into(), json!("red"));
    let id = second.call_rpc("whoami", vec![], kwargs);
    poll_until(&mut second, |c, _| c.get_rpc_result(id).is_some_and(|s| s.done)).await;
    let status = second.take_rpc_result(id).unwrap();
    assert_eq!(status.result, json!({ "caller": 2, "team": "red" }));

    host.shutdown().await;
}

// ============================================================================
// LIVENESS
// ============================================================================

#[tokio::test]
async fn test_silent_client_is_evicted_once() {
    let mut config = HostConfig::local();
    config.inactivity_timeout_secs = 0.3;
    config.recv_poll_interval_secs = 0.05;
    config.ping_interval_secs = 60.0;
    let (host, addr) = start(config).await;
    let (left, on_disconnect) = counter();
    host.on_disconnect(on_disconnect);

    let mut client = join(addr, None).await;
    let id = client.client_id().unwrap();
    assert!(wait_for(|| host.client_count() == 1).await);
    assert!(host.join_room(id, "lobby"));

    // Stay silent: no polls, no sends.
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert_eq!(host.client_count(), 0);
    assert!(host.room_members("lobby").is_empty());
    assert_eq!(left.load(Ordering::SeqCst), 1);

    poll_until(&mut client, |c, _| c.state() == ClientState::Disconnected).await;
    assert_eq!(client.state(), ClientState::Disconnected);
    assert_eq!(left.load(Ordering::SeqCst), 1);

    host.shutdown().await;
}

#[tokio::test]
async fn test_idle_client_is_pinged_and_answers() {
    let mut config = HostConfig::local();
    config.ping_interval_secs = 0.05;
    config.inactivity_timeout_secs = 0.5;
    config.recv_poll_interval_secs = 0.02;
    let (host, addr) = start(config).await;

    let mut client = join(addr, None).await;
    let id = client.client_id().unwrap();

    // The client answers pings inside poll, so it outlives the timeout.
    let started = Instant::now();
    while started.elapsed() < Duration::from_millis(900) {
        client.poll();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(client.state(), ClientState::Connected);
    assert_eq!(host.connection_ids(), vec![id]);
    assert!(host.rtt(id).is_some());
    assert!(host.tick_stats().pings_sent > 0);

    host.shutdown().await;
}

#[tokio::test]
async fn test_client_ping_measures_rtt() {
    let (host, addr) = start(HostConfig::local()).await;
    let mut client = join(addr, None).await;

    assert!(client.rtt().is_none());
    client.ping().unwrap();
    poll_until(&mut client, |c, _| c.rtt().is_some()).await;
    assert!(client.rtt().is_some());

    host.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_disconnects_everyone() {
    let (host, addr) = start(HostConfig::local()).await;
    let (left, on_disconnect) = counter();
    host.on_disconnect(on_disconnect);

    let mut a = join(addr, None).await;
    let mut b = join(addr, None).await;
    assert!(wait_for(|| host.client_count() == 2).await);

    within(host.shutdown()).await;
    within(host.shutdown()).await;
    assert!(!host.is_running());
    assert_eq!(left.load(Ordering::SeqCst), 2);

    for client in [&mut a, &mut b] {
        poll_until(client, |c, _| c.state() == ClientState::Disconnected).await;
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    assert!(matches!(host.start().await, Err(NetError::AlreadyRunning)));
}

// ============================================================================
// FAN-OUT
// ============================================================================

#[tokio::test]
async fn test_chat_is_rebroadcast_with_sender() {
    let (host, addr) = start(HostConfig::local()).await;
    let heard = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&heard);
    host.on_chat(move |id, text| {
        sink.lock().push((id, text.to_string()));
        Ok(())
    });

    let mut a = join(addr, None).await;
    let mut b = join(addr, None).await;
    let a_id = a.client_id();
    a.send_chat("hi").unwrap();

    let to_b = poll_until(&mut b, |_, seen| !chats(seen).is_empty()).await;
    let to_a = poll_until(&mut a, |_, seen| !chats(seen).is_empty()).await;
    assert_eq!(chats(&to_b), vec![(a_id, "hi".to_string())]);
    assert_eq!(chats(&to_a), vec![(a_id, "hi".to_string())]);
    assert_eq!(heard.lock().clone(), vec![(a_id.unwrap(), "hi".to_string())]);

    host.shutdown().await;
}

#[tokio::test]
async fn test_spawn_is_tagged_and_echoed() {
    let (host, addr) = start(HostConfig::local()).await;
    let spawned = Arc::new(AtomicUsize::new(0));
    let hook = Arc::clone(&spawned);
    host.on_spawn(move |_, _| {
        hook.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let mut a = join(addr, None).await;
    let mut b = join(addr, None).await;
    a.send_spawn(SpawnSpec::shape("box", Vec2::new(1.0, 2.0)).with_seed(9))
        .unwrap();

    let is_spawn = |_: &ClientEngine, seen: &[Message]| seen.iter().any(|m| matches!(m, Message::Spawn(_)));
    let to_b = poll_until(&mut b, is_spawn).await;
    let to_a = poll_until(&mut a, is_spawn).await;

    for seen in [&to_a, &to_b] {
        let spec = seen
            .iter()
            .find_map(|m| match m {
                Message::Spawn(spec) => Some(spec.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(spec.from, a.client_id());
        assert_eq!(spec.shape.as_deref(), Some("box"));
        assert_eq!(spec.seed, Some(9));
    }
    assert_eq!(spawned.load(Ordering::SeqCst), 1);

    host.broadcast_spawn(SpawnSpec::shape("ball", Vec2::ZERO));
    let hosted = poll_until(&mut b, |_, seen| {
        seen.iter().any(|m| matches!(m, Message::Spawn(s) if s.from.is_none()))
    })
    .await;
    assert!(!hosted.is_empty());
    assert_eq!(spawned.load(Ordering::SeqCst), 1);

    host.shutdown().await;
}

#[tokio::test]
async fn test_spawn_echo_can_be_disabled() {
    let mut config = HostConfig::local();
    config.echo_spawn_to_sender = false;
    let (host, addr) = start(config).await;

    let mut a = join(addr, None).await;
    let mut b = join(addr, None).await;
    a.send_spawn(SpawnSpec::shape("box", Vec2::ZERO)).unwrap();
    a.send_chat("after").unwrap();

    let to_a = poll_until(&mut a, |_, seen| !chats(seen).is_empty()).await;
    let to_b = poll_until(&mut b, |_, seen| !chats(seen).is_empty()).await;
    assert!(!to_a.iter().any(|m| matches!(m, Message::Spawn(_))));
    assert!(to_b.iter().any(|m| matches!(m, Message::Spawn(_))));

    host.shutdown().await;
}

#[tokio::test]
async fn test_room_broadcast_skips_departed_member() {
    let (host, addr) = start(HostConfig::local()).await;
    let (left, on_disconnect) = counter();
    host.on_disconnect(on_disconnect);

    let mut a = join(addr, None).await;
    let mut b = join(addr, None).await;
    let mut c = join(addr, None).await;
    for client in [&a, &b, &c] {
        assert!(host.join_room(client.client_id().unwrap(), "red"));
    }
    assert_eq!(host.room_members("red").len(), 3);
    let gone = c.client_id().unwrap();

    // Blocking sleep: the host's tasks do not run, so only the send path can
    // notice the hang-up.
    c.close();
    std::thread::sleep(Duration::from_millis(50));

    let delivered = host.broadcast_room(
        "red",
        &Message::Chat {
            from: None,
            text: "red team".into(),
        },
        None,
    );
    assert_eq!(delivered, 2);
    assert!(!host.room_members("red").contains(&gone));
    assert_eq!(host.room_members("red").len(), 2);
    assert_eq!(host.client_count(), 2);
    assert_eq!(left.load(Ordering::SeqCst), 1);

    for client in [&mut a, &mut b] {
        let seen = poll_until(client, |_, seen| !chats(seen).is_empty()).await;
        assert_eq!(chats(&seen), vec![(None, "red team".to_string())]);
    }
    assert_eq!(left.load(Ordering::SeqCst), 1);

    host.shutdown().await;
}

#[tokio::test]
async fn test_input_and_custom_reach_hooks() {
    let (host, addr) = start(HostConfig::local()).await;
    let inputs = Arc::new(Mutex::new(Vec::new()));
    let customs = Arc::new(Mutex::new(Vec::new()));
    let input_sink = Arc::clone(&inputs);
    let custom_sink = Arc::clone(&customs);
    host.on_input(move |id, payload, _ts| {
        input_sink.lock().push((id, payload.clone()));
        Ok(())
    });
    host.on_custom(move |id, subtype, data| {
        custom_sink.lock().push((id, subtype.to_string(), data.clone()));
        Ok(())
    });

    let mut client = join(addr, None).await;
    let id = client.client_id().unwrap();
    client.send_input(json!({ "thrust": 1 })).unwrap();
    let mut data = Map::new();
    data.insert("color".into(), json!("red"));
    client.send_custom("paint", data.clone()).unwrap();

    assert!(wait_for(|| customs.lock().len() == 1).await);
    assert_eq!(inputs.lock().clone(), vec![(id, json!({ "thrust": 1 }))]);
    assert_eq!(customs.lock().clone(), vec![(id, "paint".to_string(), data)]);

    host.shutdown().await;
}

#[tokio::test]
async fn test_state_snapshots_reach_clients() {
    let mut config = HostConfig::local();
    config.broadcast_hz = 50.0;
    config.compress = true;
    let (host, addr) = start(config).await;
    host.set_state_provider(|| {
        (1..=3)
            .map(|id| ObjectState::at_rest(id, Vec2::new(id as f64, 0.0), 0.0))
            .collect()
    });

    let (mut client, mut seen) = join_with_backlog(addr, None).await;
    assert!(matches!(seen[0], Message::Welcome { .. }));
    if !seen.iter().any(|m| matches!(m, Message::State { .. })) {
        seen.extend(
            poll_until(&mut client, |_, more| {
                more.iter().any(|m| matches!(m, Message::State { .. }))
            })
            .await,
        );
    }

    let init = seen.iter().position(|m| matches!(m, Message::InitState { .. }));
    let state = seen.iter().position(|m| matches!(m, Message::State { .. }));
    assert!(init.is_some());
    assert!(state.is_some());
    assert!(init < state);
    match &seen[state.unwrap()] {
        Message::State { objects, .. } => {
            assert_eq!(objects.len(), 3);
            assert_eq!(objects[2].position, Vec2::new(3.0, 0.0));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(host.tick_stats().broadcasts > 0);

    host.clear_state_provider();
    host.shutdown().await;
}

#[tokio::test]
async fn test_create_and_update_are_broadcast() {
    let (host, addr) = start(HostConfig::local()).await;
    let mut client = join(addr, None).await;

    let object = ObjectState::at_rest(42, Vec2::new(1.0, 1.0), 0.5);
    assert_eq!(host.broadcast_create(object), 1);
    assert_eq!(host.broadcast_update(object.with_velocity(Vec2::new(0.0, -1.0), 0.0)), 1);

    let seen = poll_until(&mut client, |_, seen| {
        seen.iter().any(|m| matches!(m, Message::Update { .. }))
    })
    .await;
    assert!(seen.contains(&Message::Create { object }));
    assert!(seen.iter().any(|m| matches!(m, Message::Update { object } if object.id == 42)));

    host.shutdown().await;
}
