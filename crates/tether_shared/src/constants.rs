//! # Protocol Constants
//!
//! Values both peers must agree on. Changing [`PROTOCOL_VERSION`] makes every
//! older peer fail the handshake with `error:"proto"`.

/// Wire protocol version carried in `hello` and `welcome`.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Default TCP port the host listens on.
pub const DEFAULT_PORT: u16 = 7777;

/// Default listen address (all interfaces).
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// Default number of concurrently established connections.
pub const DEFAULT_MAX_CLIENTS: usize = 32;

/// Default state broadcast frequency in Hz.
pub const DEFAULT_BROADCAST_HZ: f64 = 20.0;
