//! Message and scheduled delivery persistence.
//!
//! The trait is synchronous. Backends keep every operation short (one lock or
//! one transaction), so callers invoke them directly from async code.
//!
//! # Backends
//!
//! - [`MemoryStore`]: process-local, for tests and single-node ephemeral use
//! - [`RedbStore`]: durable, survives restarts
//! - [`ChaoticStore`]: wraps another backend and injects failures

mod chaotic;
mod error;
mod memory;
mod redb;

use std::collections::BTreeMap;

pub use chaotic::ChaoticStore;
pub use error::StorageError;
pub use memory::MemoryStore;
use roomcast_core::{DeliveryStatus, Message, NewMessage, NewSchedule, ScheduledDelivery};
use roomcast_proto::{MessageId, RoomId, ScheduleId, Timestamp, UserId};

pub use self::redb::RedbStore;

/// Persistence for messages and their scheduled deliveries.
///
/// Must be Clone (shared by the dispatcher, the delivery engine and its timer
/// tasks) and Send + Sync. Clones access the same underlying data.
///
/// # Invariants
///
/// - At most one scheduled delivery exists per message
/// - A visible message never gets a delivery
/// - `conditional_update_status` is atomic: of any number of concurrent
///   callers expecting the same status, at most one observes `1`
pub trait MessageStore: Clone + Send + Sync + 'static {
    /// Persist a message and assign its id.
    fn create_message(&self, message: NewMessage) -> Result<Message, StorageError>;

    /// Load a message. `None` if it does not exist.
    fn get_message(&self, id: MessageId) -> Result<Option<Message>, StorageError>;

    /// Set `sent_at` and clear `scheduled_at`.
    ///
    /// # Errors
    ///
    /// `StorageError::NotFound` if the message does not exist.
    fn mark_visible(&self, id: MessageId, sent_at: Timestamp) -> Result<(), StorageError>;

    /// Create a pending delivery for an existing message and stamp the
    /// message's `scheduled_at`.
    ///
    /// # Errors
    ///
    /// - `StorageError::NotFound` if the message does not exist
    /// - `StorageError::Duplicate` if the message already has a delivery
    /// - `StorageError::AlreadySent` if the message is already visible, even
    ///   when its delivery record was purged
    fn create_schedule(
        &self,
        request: NewSchedule,
        now: Timestamp,
    ) -> Result<ScheduledDelivery, StorageError>;

    /// Atomically persist a hidden message together with its pending
    /// delivery. Either both records exist afterwards or neither does.
    fn schedule_message(
        &self,
        message: NewMessage,
        scheduled_by: UserId,
        scheduled_at: Timestamp,
        now: Timestamp,
    ) -> Result<(Message, ScheduledDelivery), StorageError>;

    /// Load a delivery. `None` if it does not exist.
    fn get_schedule(&self, id: ScheduleId) -> Result<Option<ScheduledDelivery>, StorageError>;

    /// Delivery for a message, whatever its status.
    fn find_schedule_for_message(
        &self,
        message_id: MessageId,
    ) -> Result<Option<ScheduledDelivery>, StorageError>;

    /// Move a delivery from `expected` to `next` only if it still holds
    /// `expected`. Stamps `updated_at` on success.
    ///
    /// Returns the number of records changed: `1` on success, `0` if the
    /// record is missing or holds another status.
    ///
    /// # Errors
    ///
    /// `StorageError::InvalidTransition` if `expected → next` is not a
    /// lifecycle step. Nothing is changed.
    fn conditional_update_status(
        &self,
        id: ScheduleId,
        expected: DeliveryStatus,
        next: DeliveryStatus,
        now: Timestamp,
    ) -> Result<u64, StorageError>;

    /// Pending deliveries with `scheduled_at <= now`, earliest first.
    fn find_overdue(&self, now: Timestamp) -> Result<Vec<ScheduledDelivery>, StorageError>;

    /// Pending deliveries owned by `owner`, earliest first.
    fn find_scheduled_by_owner(&self, owner: UserId)
    -> Result<Vec<ScheduledDelivery>, StorageError>;

    /// Pending deliveries targeting `room`, earliest first.
    fn find_scheduled_by_room(&self, room: &RoomId)
    -> Result<Vec<ScheduledDelivery>, StorageError>;

    /// Delete terminal deliveries last updated before `cutoff`. Messages are
    /// kept. Returns the number of deleted records.
    fn purge_terminal_before(&self, cutoff: Timestamp) -> Result<usize, StorageError>;

    /// Number of deliveries in each status. Every status is present.
    fn count_by_status(&self) -> Result<BTreeMap<DeliveryStatus, u64>, StorageError>;
}

/// Ordering used by every listing: delivery time, then creation order.
pub(crate) fn sort_schedules(records: &mut [ScheduledDelivery]) {
    records.sort_by_key(|r| (r.scheduled_at, r.id));
}

/// Zeroed per-status counters.
pub(crate) fn empty_counts() -> BTreeMap<DeliveryStatus, u64> {
    DeliveryStatus::ALL.into_iter().map(|s| (s, 0)).collect()
}
