//! # Tether Shared
//!
//! Plain data used on both sides of the network boundary.
//!
//! ## Rule
//!
//! This crate must stay free of I/O. The simulation thread builds
//! [`ObjectState`] records from its physics bodies and hands them to the
//! network layer; nothing in here may reach back into either side.

#![deny(unsafe_code)]

pub mod constants;
pub mod math;
pub mod object;

pub use constants::{
    DEFAULT_BIND_HOST, DEFAULT_BROADCAST_HZ, DEFAULT_MAX_CLIENTS, DEFAULT_PORT, PROTOCOL_VERSION,
};
pub use math::Vec2;
pub use object::{ObjectId, ObjectState};
