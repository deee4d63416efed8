//! Error types shared by the codec, the request queue and the controller façade.

use thiserror::Error;

/// Frame-level decode failures.
///
/// These are always recovered at the connection layer: the offending frame is
/// logged and dropped, the connection keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("malformed frame: declared length {declared}, received {received} bytes")]
    MalformedFrame { declared: usize, received: usize },

    #[error("frame truncated: {0} bytes is shorter than the header")]
    Truncated(usize),

    #[error("unknown message type 0x{0:04x}")]
    UnknownMessageType(u16),

    #[error("invalid payload for {kind}: expected {expected} bytes, got {actual}")]
    InvalidPayload {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Failure reported by the byte transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

/// Outcome of a request that did not end in an acknowledgment.
///
/// Every accepted request resolves exactly once, either with its ack or with
/// one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Transport not usable yet. Retry later.
    #[error("connection is not ready")]
    ConnectionNotReady,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Unexpected payload size or schema on an identity/status query.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),
}

impl From<TransportError> for SessionError {
    fn from(error: TransportError) -> Self {
        SessionError::ConnectionLost(error.0)
    }
}
