//! Error types for the routing core.

use std::io;
use thiserror::Error;

/// Result type alias for routing core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the routing core.
///
/// Errors are cheap to clone so that a failed request can be resolved
/// through its completion handle while the same error is returned to the
/// dispatching caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Routing errors, surfaced to callers of dispatch and fill.
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    /// RESP decode errors. These terminate the associated connection.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Socket-level errors. These drain the connection's queues.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A migration probe was answered with an error reply; the reply text
    /// becomes the triggering request's result.
    #[error("migration probe failed: {0}")]
    Probe(String),
}

/// Routing related errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// The router has been closed.
    #[error("use of closed router")]
    ClosedRouter,

    /// Slot id outside `[0, MAX_SLOT_NUM)`.
    #[error("use of invalid slot id: {0}")]
    InvalidSlotId(usize),

    /// Unknown forwarder method tag.
    #[error("use of invalid forwarder method: {0}")]
    InvalidMethod(String),

    /// The slot has no backend bound.
    #[error("slot {0} is not ready")]
    SlotNotReady(usize),
}

/// RESP decode errors.
///
/// The first decode error latches the decoder; every later call fails with
/// [`ProtocolError::FailedDecoder`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad CRLF end")]
    BadCrlf,

    #[error("bad resp type: 0x{0:02x}")]
    BadFrameType(u8),

    #[error("bad integer literal")]
    BadInteger,

    #[error("bad array len")]
    BadArrayLen,

    #[error("bad array len, too long")]
    BadArrayLenTooLong,

    #[error("bad bulk bytes len")]
    BadBulkLen,

    #[error("bad bulk bytes len, too long")]
    BadBulkLenTooLong,

    #[error("bad multi-bulk len")]
    BadMultiBulkLen,

    #[error("bad multi-bulk content, should be bulk bytes")]
    BadMultiBulkContent,

    /// A migration probe was answered with a frame that is neither an
    /// integer, an acknowledgement, nor an error.
    #[error("bad probe reply, should be integer")]
    BadProbeReply,

    #[error("use of failed decoder")]
    FailedDecoder,
}

/// Socket-level errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection to a backend could not be established.
    #[error("connect to {addr} failed: {reason}")]
    ConnectFailed { addr: String, reason: String },

    /// The backend connection was torn down while the request was pending.
    #[error("backend connection reset")]
    ConnectionReset,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Generic I/O failure.
    #[error("io error: {0}")]
    Io(String),
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Transport(e.into())
    }
}
