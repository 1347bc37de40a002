//! Driver error types.

use std::sync::Arc;

use basalt_protocol::CodecError;
use thiserror::Error;

/// Errors surfaced to callers through a [`Completion`](crate::Completion)
/// or returned directly from driver entry points.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    /// The frame bytes themselves were bad. Fatal to the single frame,
    /// not to the connection unless repeated.
    #[error("malformed frame: {0}")]
    MalformedFrame(CodecError),

    /// The peer spoke a protocol version this driver does not implement.
    #[error("unsupported protocol version byte {0:#04x}")]
    UnsupportedVersion(u8),

    /// Transport or protocol failure; fails every request pending on the
    /// connection and triggers pool-level reconnection.
    #[error("connection closed")]
    ConnectionClosed,

    /// A per-slot or scheduler deadline elapsed. Non-fatal to the
    /// connection.
    #[error("request timed out")]
    RequestTimedOut,

    /// Every connection to the host is saturated; backpressure, not
    /// retried automatically beyond the plan walk.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// The write backlog for a connection is full; load-shed instead of
    /// queuing unboundedly.
    #[error("connection pool saturated")]
    PoolSaturated,

    /// The query plan was exhausted without a single dispatch.
    #[error("no hosts available for request")]
    NoHostsAvailable,

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Server-reported failure for one request.
    #[error("server error {code:#06x}: {message}")]
    Server { code: u32, message: String },

    /// The peer answered with something the exchange does not allow.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("session is closed")]
    SessionClosed,

    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<CodecError> for DriverError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::UnsupportedVersion(version) => DriverError::UnsupportedVersion(version),
            other => DriverError::MalformedFrame(other),
        }
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::Io(Arc::new(err))
    }
}

pub type DriverResult<T> = Result<T, DriverError>;
