//! Transport errors

/// Errors raised by transports, codecs and the relay
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The other side went away
    #[error("connection closed")]
    Closed,

    /// Relay is not accepting connections
    #[error("relay unavailable: {0}")]
    Unavailable(String),

    /// Socket failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame body is not a valid message
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Frame length exceeds the limit
    #[error("frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Announced body length
        size: usize,
        /// Configured limit
        max: usize,
    },

    /// Peer sent something the protocol does not allow here
    #[error("protocol violation: {0}")]
    Protocol(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_limit_message() {
        let err = TransportError::FrameTooLarge { size: 10, max: 5 };
        assert_eq!(err.to_string(), "frame of 10 bytes exceeds limit of 5 bytes");
    }
}
