//! Scheduled delivery records.
//!
//! A [`ScheduledDelivery`] tracks one message whose visibility is deferred
//! until `scheduled_at`. Its status moves through a one-way lifecycle:
//!
//! ```text
//!            fire ┌──────┐
//!         ┌──────>│ Sent │
//!         │       └──────┘
//! ┌─────────┐     ┌───────────┐
//! │ Pending │────>│ Cancelled │
//! └─────────┘     └───────────┘
//!         │       ┌────────┐
//!         └──────>│ Failed │
//!                 └────────┘
//! ```
//!
//! Terminal states never change again. The store enforces this with a
//! compare-and-set on status; [`ScheduledDelivery::transition`] is the
//! in-memory mirror used by backends that hold records directly.

use std::{fmt, time::Duration};

use roomcast_proto::{MessageId, RoomId, ScheduleId, ScheduledItem, Timestamp, UserId};
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Lifecycle state of a scheduled delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Waiting for its delivery time
    Pending,
    /// Delivered; the message is visible
    Sent,
    /// Withdrawn by its owner before delivery
    Cancelled,
    /// The message could not be delivered
    Failed,
}

impl DeliveryStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 4] = [Self::Pending, Self::Sent, Self::Cancelled, Self::Failed];

    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Whether `self → next` is a legal lifecycle step.
    pub fn can_transition_to(self, next: Self) -> bool {
        self == Self::Pending && next.is_terminal()
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Input for creating a scheduled delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSchedule {
    /// Message to make visible
    pub message_id: MessageId,
    /// Room the message belongs to
    pub room_id: RoomId,
    /// Owner; the only identity allowed to cancel
    pub scheduled_by: UserId,
    /// Delivery time
    pub scheduled_at: Timestamp,
}

/// Persisted scheduled delivery record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledDelivery {
    /// Record id
    pub id: ScheduleId,
    /// Message to make visible (one record per message)
    pub message_id: MessageId,
    /// Room the message belongs to
    pub room_id: RoomId,
    /// Owner
    pub scheduled_by: UserId,
    /// Delivery time
    pub scheduled_at: Timestamp,
    /// Lifecycle state
    pub status: DeliveryStatus,
    /// When the record was created
    pub created_at: Timestamp,
    /// When the status last changed
    pub updated_at: Timestamp,
}

impl ScheduledDelivery {
    /// Build a pending record from a request.
    pub fn pending(id: ScheduleId, request: NewSchedule, now: Timestamp) -> Self {
        Self {
            id,
            message_id: request.message_id,
            room_id: request.room_id,
            scheduled_by: request.scheduled_by,
            scheduled_at: request.scheduled_at,
            status: DeliveryStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pending and at or past its delivery time.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status == DeliveryStatus::Pending && self.scheduled_at <= now
    }

    /// Time left until delivery, zero if already due.
    pub fn delay_from(&self, now: Timestamp) -> Duration {
        self.scheduled_at.saturating_since(now)
    }

    /// Apply a lifecycle step.
    ///
    /// # Errors
    ///
    /// `DeliveryError::InvalidTransition` if the step is not allowed. The
    /// record is left unchanged.
    pub fn transition(&mut self, to: DeliveryStatus, now: Timestamp) -> Result<(), DeliveryError> {
        if !self.status.can_transition_to(to) {
            return Err(DeliveryError::InvalidTransition { from: self.status, to });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Terminal and last touched before `cutoff`.
    pub fn is_expired(&self, cutoff: Timestamp) -> bool {
        self.status.is_terminal() && self.updated_at < cutoff
    }

    /// Listing row for the owner.
    pub fn to_item(&self, content: String) -> ScheduledItem {
        ScheduledItem {
            message_id: self.message_id,
            room_id: self.room_id.clone(),
            scheduled_at: self.scheduled_at,
            content,
        }
    }
}
