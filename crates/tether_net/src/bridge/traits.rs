//! # Simulation Interface
//!
//! The simulation implements [`Simulation`] to receive network events.
//! Every method has a no-op default, so a simulation only overrides what it
//! cares about.
//!
//! ```text
//! Bridge calls:           Simulation implements:
//! ┌──────────────────┐    ┌──────────────────┐
//! │ update(dt, sim)  │ ─> │ impl Simulation  │
//! └──────────────────┘    └──────────────────┘
//! ```
//!
//! All methods run on the simulation thread, inside `NetworkBridge::update`.

use std::time::Duration;

use serde_json::{Map, Value};
use tether_shared::ObjectState;

use super::events::{NetEvent, NetStatus, RpcTicket};
use crate::client::RpcStatus;
use crate::protocol::{ConnectionId, SpawnSpec};

/// Receiver of network events on the simulation thread.
#[allow(unused_variables)]
pub trait Simulation {
    /// Connection status changed.
    fn on_status(&mut self, status: &NetStatus) {}

    /// A client joined this host.
    fn on_client_joined(&mut self, id: ConnectionId) {}

    /// A client left this host.
    fn on_client_left(&mut self, id: ConnectionId) {}

    /// Create an object authored by another peer.
    fn on_spawn(&mut self, spec: &SpawnSpec) {}

    /// Apply an authoritative snapshot.
    fn on_state(&mut self, objects: &[ObjectState], ts: u64) {}

    /// Replace the world with the host's.
    fn on_init_state(&mut self, objects: &[ObjectState]) {}

    /// An object was created on the host.
    fn on_create(&mut self, object: &ObjectState) {}

    /// An object changed on the host.
    fn on_update(&mut self, object: &ObjectState) {}

    /// Application-defined message.
    fn on_custom(&mut self, from: Option<ConnectionId>, subtype: &str, data: &Map<String, Value>) {}

    /// Player input arrived (host side).
    fn on_input(&mut self, from: ConnectionId, payload: &Value, ts: u64) {}

    /// Chat line.
    fn on_chat(&mut self, from: Option<ConnectionId>, text: &str) {}

    /// A bridge RPC finished.
    fn on_rpc_result(&mut self, ticket: RpcTicket, status: &RpcStatus) {}

    /// End of one `update`: `applied` events were delivered this frame,
    /// which lasted `dt`.
    fn on_frame(&mut self, dt: Duration, applied: usize) {}
}

impl NetEvent {
    /// Hands this event to the matching [`Simulation`] method.
    pub fn apply<S: Simulation + ?Sized>(&self, sim: &mut S) {
        match self {
            Self::Status(status) => sim.on_status(status),
            Self::ClientJoined(id) => sim.on_client_joined(*id),
            Self::ClientLeft(id) => sim.on_client_left(*id),
            Self::Spawn(spec) => sim.on_spawn(spec),
            Self::State { objects, ts } => sim.on_state(objects, *ts),
            Self::InitState(objects) => sim.on_init_state(objects),
            Self::Create(object) => sim.on_create(object),
            Self::Update(object) => sim.on_update(object),
            Self::Custom { from, subtype, data } => sim.on_custom(*from, subtype, data),
            Self::Input { from, payload, ts } => sim.on_input(*from, payload, *ts),
            Self::Chat { from, text } => sim.on_chat(*from, text),
            Self::RpcResolved { ticket, status } => sim.on_rpc_result(*ticket, status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_shared::Vec2;

    #[derive(Default)]
    struct Counter {
        spawns: usize,
        objects: usize,
        chat: Vec<String>,
    }

    impl Simulation for Counter {
        fn on_spawn(&mut self, _spec: &SpawnSpec) {
            self.spawns += 1;
        }

        fn on_state(&mut self, objects: &[ObjectState], _ts: u64) {
            self.objects = objects.len();
        }

        fn on_chat(&mut self, _from: Option<ConnectionId>, text: &str) {
            self.chat.push(text.to_string());
        }
    }

    #[test]
    fn test_apply_routes_events() {
        let mut sim = Counter::default();
        let events = [
            NetEvent::Spawn(SpawnSpec::shape("box", Vec2::new(1.0, 1.0))),
            NetEvent::State {
                objects: vec![ObjectState::default(); 3],
                ts: 1,
            },
            NetEvent::Chat {
                from: None,
                text: "gg".into(),
            },
            NetEvent::ClientLeft(ConnectionId(4)),
        ];
        for event in &events {
            event.apply(&mut sim);
        }
        assert_eq!(sim.spawns, 1);
        assert_eq!(sim.objects, 3);
        assert_eq!(sim.chat, vec!["gg"]);
    }
}
