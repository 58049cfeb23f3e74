//! # Network Error Types
//!
//! All errors that can surface from the network layer.
//!
//! Transport-level variants always mean "this one connection is gone";
//! nothing here is fatal to a running host.

use thiserror::Error;

use crate::protocol::RejectReason;

/// Errors that can occur in the network layer.
#[derive(Error, Debug)]
pub enum NetError {
    /// Socket-level failure (connect, accept, read, write).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the stream (zero-length read) or the connection was closed locally.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation needs an established connection.
    #[error("not connected")]
    NotConnected,

    /// A bounded wait expired.
    #[error("operation timed out")]
    Timeout,

    /// The host refused the handshake.
    #[error("handshake rejected: {0}")]
    Rejected(RejectReason),

    /// A peer kept sending without a frame delimiter.
    #[error("frame too large: {len} bytes buffered, limit {max}")]
    FrameTooLarge {
        /// Bytes buffered without a delimiter.
        len: usize,
        /// Configured limit.
        max: usize,
    },

    /// Message could not be serialized.
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Configuration file or value is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The engine was started twice.
    #[error("already running")]
    AlreadyRunning,

    /// The network thread is gone.
    #[error("bridge unavailable: {0}")]
    Bridge(String),
}

impl NetError {
    /// Returns true if this error means the connection can no longer be used.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionClosed | Self::Timeout | Self::FrameTooLarge { .. }
        )
    }
}

/// Result type for network operations.
pub type NetResult<T> = Result<T, NetError>;

/// Failure reported by an RPC handler or an event callback.
///
/// Converted into `rpc_result{ok:false}` for RPC, logged and ignored otherwise.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Creates a handler error from any displayable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}
