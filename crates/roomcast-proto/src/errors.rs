//! Error types for wire encoding and decoding.

use thiserror::Error;

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur while decoding a signal or encoding an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame exceeded the maximum accepted size
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Frame was not valid JSON or did not match any known signal
    #[error("malformed signal: {0}")]
    Malformed(String),

    /// Event could not be serialized
    #[error("encode failed: {0}")]
    Encode(String),
}
