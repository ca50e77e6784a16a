//! Storage error types.

use roomcast_core::{DeliveryError, DeliveryStatus};
use thiserror::Error;

/// Errors returned by [`MessageStore`](super::MessageStore) backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Backend I/O failed (disk, database, injected fault)
    #[error("I/O error: {0}")]
    Io(String),

    /// A stored record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Referenced record does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Uniqueness constraint violated
    #[error("duplicate {0}")]
    Duplicate(String),

    /// Message is already visible and cannot be deferred
    #[error("{0} already sent")]
    AlreadySent(String),

    /// Status change outside the delivery lifecycle
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Status expected by the caller
        from: DeliveryStatus,
        /// Requested status
        to: DeliveryStatus,
    },
}

impl StorageError {
    /// Returns true if the operation may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl From<StorageError> for DeliveryError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(msg) => Self::StoreUnavailable(msg),
            StorageError::Serialization(msg) => Self::StoreUnavailable(format!("corrupt record: {msg}")),
            StorageError::NotFound(what) => Self::NotFound(what),
            StorageError::Duplicate(_) => Self::Conflict { status: DeliveryStatus::Pending },
            StorageError::AlreadySent(_) => Self::Conflict { status: DeliveryStatus::Sent },
            StorageError::InvalidTransition { from, to } => Self::InvalidTransition { from, to },
        }
    }
}
