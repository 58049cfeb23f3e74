//! # Session Registry
//!
//! Connection table and room memberships for one host.
//!
//! ## Design
//!
//! - Identifiers start at 1 and are never reused by the same registry
//! - Removing a peer removes it from every room in the same call; empty
//!   rooms are deleted
//! - Sends never suspend: each peer owns an unbounded queue drained by its
//!   writer task
//! - Broadcasts report dead peers instead of removing them mid-iteration
//! - A peer whose remote end has hung up counts as dead at send time, even
//!   before its receive loop notices

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::protocol::ConnectionId;

/// One encoded frame, shared between every queue it is pushed to.
pub type Frame = Arc<[u8]>;

/// Registry entry for an established connection.
#[derive(Debug)]
pub struct Peer {
    addr: SocketAddr,
    tx: UnboundedSender<Frame>,
    cancel: CancellationToken,
    link: Option<TcpStream>,
    last_activity: Instant,
    last_ping: Option<Instant>,
    rtt: Option<Duration>,
    rooms: BTreeSet<String>,
}

impl Peer {
    /// Creates an entry feeding `tx`; cancelling `cancel` stops its tasks.
    #[must_use]
    pub fn new(addr: SocketAddr, tx: UnboundedSender<Frame>, cancel: CancellationToken) -> Self {
        Self {
            addr,
            tx,
            cancel,
            link: None,
            last_activity: Instant::now(),
            last_ping: None,
            rtt: None,
            rooms: BTreeSet::new(),
        }
    }

    /// Attaches a non-blocking handle to the peer's socket, used to notice
    /// a remote hang-up before the receive loop does.
    #[must_use]
    pub fn with_link(mut self, link: TcpStream) -> Self {
        self.link = Some(link);
        self
    }

    fn hung_up(&self) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        let mut byte = [0u8; 1];
        match link.peek(&mut byte) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) => !matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted),
        }
    }

    fn send(&self, frame: &Frame) -> bool {
        !self.cancel.is_cancelled()
            && !self.tx.is_closed()
            && !self.hung_up()
            && self.tx.send(Arc::clone(frame)).is_ok()
    }

    /// Remote address.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Last measured round trip.
    #[must_use]
    pub const fn rtt(&self) -> Option<Duration> {
        self.rtt
    }
}

/// Connections and rooms of one host.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    peers: BTreeMap<ConnectionId, Peer>,
    rooms: HashMap<String, BTreeSet<ConnectionId>>,
    last_id: u64,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of established connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns true if nobody is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Returns true if `max_clients` connections are established.
    #[must_use]
    pub fn is_full(&self, max_clients: usize) -> bool {
        self.peers.len() >= max_clients
    }

    /// Returns true if `id` is registered.
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.peers.contains_key(&id)
    }

    /// Registered identifiers in ascending order.
    #[must_use]
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.peers.keys().copied().collect()
    }

    /// Looks up a peer.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    /// Registers a peer under a fresh identifier.
    pub fn insert(&mut self, peer: Peer) -> ConnectionId {
        self.last_id += 1;
        let id = ConnectionId(self.last_id);
        self.peers.insert(id, peer);
        id
    }

    /// Unregisters a peer, leaves all its rooms and cancels its tasks.
    ///
    /// Returns `None` if it was already gone.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Peer> {
        let peer = self.peers.remove(&id)?;
        for room in &peer.rooms {
            if let Some(members) = self.rooms.get_mut(room) {
                members.remove(&id);
                if members.is_empty() {
                    self.rooms.remove(room);
                }
            }
        }
        peer.cancel.cancel();
        Some(peer)
    }

    /// Removes every peer, returning their identifiers.
    pub fn remove_all(&mut self) -> Vec<ConnectionId> {
        let ids = self.ids();
        for &id in &ids {
            self.remove(id);
        }
        ids
    }

    /// Records inbound traffic.
    pub fn touch(&mut self, id: ConnectionId) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.last_activity = Instant::now();
        }
    }

    /// Stores a round-trip measurement.
    pub fn set_rtt(&mut self, id: ConnectionId, rtt: Duration) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.rtt = Some(rtt);
        }
    }

    /// Adds `id` to `room`, creating the room. False if `id` is unknown.
    pub fn join_room(&mut self, id: ConnectionId, room: &str) -> bool {
        let Some(peer) = self.peers.get_mut(&id) else {
            return false;
        };
        peer.rooms.insert(room.to_string());
        self.rooms.entry(room.to_string()).or_default().insert(id);
        true
    }

    /// Removes `id` from `room`; the last leaver deletes the room.
    ///
    /// Returns false if `id` was not a member.
    pub fn leave_room(&mut self, id: ConnectionId, room: &str) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let was_member = members.remove(&id);
        if members.is_empty() {
            self.rooms.remove(room);
        }
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.rooms.remove(room);
        }
        was_member
    }

    /// Members of `room` in ascending order; empty for unknown rooms.
    #[must_use]
    pub fn room_members(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Names of the rooms that currently exist.
    #[must_use]
    pub fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.keys().cloned().collect();
        names.sort();
        names
    }

    /// Queues a frame for one peer. False if unknown or dead.
    pub fn send_to(&self, id: ConnectionId, frame: &Frame) -> bool {
        self.peers.get(&id).is_some_and(|peer| peer.send(frame))
    }

    /// Queues a frame for every peer except `exclude`.
    ///
    /// Returns the delivery count and the peers whose queue is gone.
    pub fn broadcast(&self, frame: &Frame, exclude: Option<ConnectionId>) -> (usize, Vec<ConnectionId>) {
        self.deliver(self.peers.keys().copied(), frame, exclude)
    }

    /// Like [`SessionRegistry::broadcast`], restricted to `room`.
    pub fn broadcast_room(
        &self,
        room: &str,
        frame: &Frame,
        exclude: Option<ConnectionId>,
    ) -> (usize, Vec<ConnectionId>) {
        match self.rooms.get(room) {
            Some(members) => self.deliver(members.iter().copied(), frame, exclude),
            None => (0, Vec::new()),
        }
    }

    fn deliver(
        &self,
        targets: impl Iterator<Item = ConnectionId>,
        frame: &Frame,
        exclude: Option<ConnectionId>,
    ) -> (usize, Vec<ConnectionId>) {
        let mut delivered = 0;
        let mut dead = Vec::new();
        for id in targets.filter(|&id| Some(id) != exclude) {
            if self.send_to(id, frame) {
                delivered += 1;
            } else {
                dead.push(id);
            }
        }
        (delivered, dead)
    }

    /// Pings every peer silent for `interval` that was not pinged within it.
    ///
    /// Returns the ping count and the peers whose queue is gone.
    pub fn ping_idle(&mut self, frame: &Frame, interval: Duration, now: Instant) -> (usize, Vec<ConnectionId>) {
        let mut pinged = 0;
        let mut dead = Vec::new();
        for (&id, peer) in &mut self.peers {
            let idle = now.saturating_duration_since(peer.last_activity) >= interval;
            let recently_pinged = peer
                .last_ping
                .is_some_and(|at| now.saturating_duration_since(at) < interval);
            if !idle || recently_pinged {
                continue;
            }
            if peer.send(frame) {
                peer.last_ping = Some(now);
                pinged += 1;
            } else {
                dead.push(id);
            }
        }
        (pinged, dead)
    }
}
