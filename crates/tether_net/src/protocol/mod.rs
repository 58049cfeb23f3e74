//! # Wire Protocol
//!
//! Line-delimited JSON frames.
//!
//! ## Frame Structure
//!
//! ```text
//! plain:       {"type":"chat","from":3,"text":"hi"}\n
//! compressed:  {"$c":true,"d":"<base64 of lz4(size-prefixed) payload>"}\n
//! ```
//!
//! ## Design Philosophy
//!
//! - One message per line, the newline is the only delimiter
//! - Malformed frames decode to `None` and are dropped, never fatal
//! - Compression is opt-in per frame, used for bulky snapshots
//! - The shared secret never crosses the wire, only its digest

mod auth;
mod codec;
mod message;

pub use auth::{now, sign, verify_token};
pub use codec::{decode, encode, COMPRESSED_KEY, DATA_KEY, MAX_DECOMPRESSED_BYTES};
pub use message::{ConnectionId, Message, RejectReason, RpcId, SpawnSpec};
