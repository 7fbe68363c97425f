//! RESP wire protocol: frames, streaming decoder, encoder.

mod decoder;
mod encoder;

pub use decoder::Decoder;
pub use encoder::{encode_command, encode_frame};

use bytes::Bytes;

/// Upper bound on one bulk-string payload (512 MiB).
pub const MAX_BULK_BYTES: i64 = 512 * 1024 * 1024;

/// Upper bound on one array's element count (1 Mi).
pub const MAX_ARRAY_LEN: i64 = 1024 * 1024;

/// One decoded RESP frame.
///
/// Bulk strings and arrays of length `-1` decode to the `None` variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespFrame {
    /// Simple string (`+OK\r\n`).
    Simple(Bytes),
    /// Error (`-ERR ...\r\n`).
    Error(Bytes),
    /// Integer (`:42\r\n`).
    Integer(i64),
    /// Bulk string (`$5\r\nhello\r\n`); `None` is the null bulk.
    Bulk(Option<Bytes>),
    /// Array (`*2\r\n...`); `None` is the null array.
    Array(Option<Vec<RespFrame>>),
}

impl RespFrame {
    /// A non-null bulk string.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        RespFrame::Bulk(Some(data.into()))
    }

    /// The null bulk string.
    pub fn null_bulk() -> Self {
        RespFrame::Bulk(None)
    }

    /// A simple string.
    pub fn simple(data: impl Into<Bytes>) -> Self {
        RespFrame::Simple(data.into())
    }

    /// An error reply.
    pub fn error(data: impl Into<Bytes>) -> Self {
        RespFrame::Error(data.into())
    }

    /// Whether this frame is an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, RespFrame::Error(_))
    }

    /// Payload bytes of a non-null bulk string.
    pub fn as_bulk(&self) -> Option<&Bytes> {
        match self {
            RespFrame::Bulk(Some(data)) => Some(data),
            _ => None,
        }
    }
}
