use thiserror::Error;

/// Failures surfaced by the session clients and the relay.
///
/// Every variant is handled at the boundary where it occurs and turned into a
/// [`ConnectionState`](crate::models::ConnectionState) transition; callers see
/// them as return values of the operation that triggered them.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Capture source missing or permission denied. Terminal for the attempt.
    #[error("capture device unavailable: {0}")]
    Device(String),

    /// Channel-level failure (open failed, socket error).
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed or unparseable inbound message. Only that message is dropped.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Remote or local close of the channel.
    #[error("channel closed")]
    ChannelClosed,

    /// A captured frame could not be encoded or decoded.
    #[error("frame encoding failed: {0}")]
    Encode(String),

    #[error("session already active")]
    AlreadyActive,
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Protocol(e.to_string())
    }
}
