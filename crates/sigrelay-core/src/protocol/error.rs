//! Protocol error types.

/// Maximum frame size accepted on any sigrelay connection.
///
/// Signal packets are small (well under 1 KiB); 64 KiB leaves headroom
/// for future message growth while keeping the pre-allocation bound
/// tight enough that a hostile length prefix cannot exhaust memory.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Errors at the framing and message-decode layers.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A frame's length prefix exceeded the configured maximum.
    #[error("frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Declared frame size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A frame payload could not be decoded as a wire message.
    #[error("malformed frame: {detail}")]
    Malformed {
        /// What failed to decode.
        detail: String,
    },

    /// The peer sent a message type that is not valid in this direction
    /// or connection phase.
    #[error("unexpected message type {message_type:#04x}")]
    UnexpectedMessage {
        /// The offending message type byte.
        message_type: u8,
    },

    /// A bounded I/O deadline expired. Hard error, never retried in
    /// place.
    #[error("timeout during {operation}")]
    Timeout {
        /// What was in flight.
        operation: &'static str,
    },

    /// Underlying socket error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Shorthand for a malformed-frame error.
    #[must_use]
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::Malformed {
            detail: detail.into(),
        }
    }
}

/// Result alias for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
