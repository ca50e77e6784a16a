//! Server error types.

use std::fmt;

use roomcast_core::DeliveryError;
use roomcast_proto::ProtocolError;

use crate::storage::StorageError;

/// Errors that can occur in the server runtime.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error (invalid bind address, unusable database path).
    ///
    /// Fatal: prevents startup. Fix configuration and restart.
    Config(String),

    /// Transport/network error (bind failure, WebSocket handshake, I/O).
    ///
    /// May be transient (one client's connection broke) or fatal (bind
    /// address in use). Check error message for details.
    Transport(String),

    /// A client sent a frame that is not a valid signal.
    ///
    /// Fatal for that frame only. The connection stays open.
    Protocol(ProtocolError),

    /// A request failed in the delivery, presence or registry layers.
    Delivery(DeliveryError),

    /// Storage backend failed while starting up.
    Storage(StorageError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Protocol(err) => write!(f, "protocol error: {err}"),
            Self::Delivery(err) => write!(f, "delivery error: {err}"),
            Self::Storage(err) => write!(f, "storage error: {err}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protocol(err) => Some(err),
            Self::Delivery(err) => Some(err),
            Self::Storage(err) => Some(err),
            Self::Config(_) | Self::Transport(_) => None,
        }
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

impl From<DeliveryError> for ServerError {
    fn from(err: DeliveryError) -> Self {
        Self::Delivery(err)
    }
}

impl From<StorageError> for ServerError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ServerError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
