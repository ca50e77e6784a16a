//! Error types shared by the delivery, presence and registry layers.

use roomcast_proto::{ConnectionId, ErrorCode};
use thiserror::Error;

use crate::delivery::DeliveryStatus;

/// Errors surfaced by server operations.
///
/// Each variant maps onto one wire [`ErrorCode`] so the dispatcher can reply
/// to the acting connection without inspecting message text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Entity does not exist or does not belong to the requester
    #[error("{0} not found")]
    NotFound(String),

    /// Record already left the expected state
    #[error("{}", conflict_message(.status))]
    Conflict {
        /// Status the record holds now
        status: DeliveryStatus,
    },

    /// Operation needs an authenticated connection
    #[error("authentication required")]
    AuthRequired,

    /// Persistence backend failed; the request may be retried
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Connection's outbound queue is closed or full
    #[error("connection {0} unreachable")]
    DeliveryUnreachable(ConnectionId),

    /// Status transition not allowed by the delivery lifecycle
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current status
        from: DeliveryStatus,
        /// Requested status
        to: DeliveryStatus,
    },
}

fn conflict_message(status: &DeliveryStatus) -> String {
    match status {
        DeliveryStatus::Sent => "message was already sent, cannot cancel".to_string(),
        DeliveryStatus::Cancelled => "message was already cancelled".to_string(),
        DeliveryStatus::Failed => "message delivery already failed".to_string(),
        DeliveryStatus::Pending => "message is still pending".to_string(),
    }
}

impl DeliveryError {
    /// Returns true if retrying the same request may succeed.
    ///
    /// Only backend outages are transient. Conflicts and missing records are
    /// final answers about current state.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Wire error category.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Conflict { .. } | Self::InvalidTransition { .. } => ErrorCode::Conflict,
            Self::AuthRequired => ErrorCode::AuthRequired,
            Self::StoreUnavailable(_) => ErrorCode::StoreUnavailable,
            Self::DeliveryUnreachable(_) => ErrorCode::Rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_after_send_describes_the_race() {
        let err = DeliveryError::Conflict { status: DeliveryStatus::Sent };
        assert_eq!(err.to_string(), "message was already sent, cannot cancel");
        assert_eq!(err.code(), ErrorCode::Conflict);
    }

    #[test]
    fn only_store_failures_are_transient() {
        assert!(DeliveryError::StoreUnavailable("disk".into()).is_transient());
        assert!(!DeliveryError::NotFound("schedule".into()).is_transient());
        assert!(!DeliveryError::Conflict { status: DeliveryStatus::Cancelled }.is_transient());
        assert!(!DeliveryError::AuthRequired.is_transient());
    }

    #[test]
    fn not_found_display() {
        let err = DeliveryError::NotFound("scheduled message 4".into());
        assert_eq!(err.to_string(), "scheduled message 4 not found");
    }
}
