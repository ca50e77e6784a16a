use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use roomcast_core::{DeliveryStatus, Message, NewMessage, NewSchedule, ScheduledDelivery};
use roomcast_proto::{MessageId, RoomId, ScheduleId, Timestamp, UserId};

use super::{MessageStore, StorageError, empty_counts, sort_schedules};

/// In-memory store for tests and ephemeral deployments.
///
/// All state sits behind one mutex, which makes every operation (including
/// the conditional update) trivially atomic. Clone is cheap (Arc).
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Default)]
struct MemoryStoreInner {
    next_message_id: u64,
    next_schedule_id: u64,
    messages: HashMap<MessageId, Message>,
    schedules: HashMap<ScheduleId, ScheduledDelivery>,
    /// Message → its delivery (one per message)
    by_message: HashMap<MessageId, ScheduleId>,
}

impl MemoryStoreInner {
    fn insert_message(&mut self, new: NewMessage) -> Message {
        self.next_message_id += 1;
        let message = Message::from_new(MessageId(self.next_message_id), new);
        self.messages.insert(message.id, message.clone());
        message
    }

    fn insert_schedule(
        &mut self,
        request: NewSchedule,
        now: Timestamp,
    ) -> Result<ScheduledDelivery, StorageError> {
        if self.by_message.contains_key(&request.message_id) {
            return Err(StorageError::Duplicate(format!(
                "schedule for message {}",
                request.message_id
            )));
        }
        let message = self
            .messages
            .get_mut(&request.message_id)
            .ok_or_else(|| StorageError::NotFound(format!("message {}", request.message_id)))?;
        if message.is_visible() {
            return Err(StorageError::AlreadySent(format!("message {}", request.message_id)));
        }
        message.scheduled_at = Some(request.scheduled_at);

        self.next_schedule_id += 1;
        let record = ScheduledDelivery::pending(ScheduleId(self.next_schedule_id), request, now);
        self.by_message.insert(record.message_id, record.id);
        self.schedules.insert(record.id, record.clone());
        Ok(record)
    }

    fn pending_where(&self, keep: impl Fn(&ScheduledDelivery) -> bool) -> Vec<ScheduledDelivery> {
        let mut records: Vec<_> = self
            .schedules
            .values()
            .filter(|r| r.status == DeliveryStatus::Pending && keep(r))
            .cloned()
            .collect();
        sort_schedules(&mut records);
        records
    }
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages.
    pub fn message_count(&self) -> usize {
        self.inner.lock().messages.len()
    }

    /// Number of stored deliveries, any status.
    pub fn schedule_count(&self) -> usize {
        self.inner.lock().schedules.len()
    }
}

impl MessageStore for MemoryStore {
    fn create_message(&self, message: NewMessage) -> Result<Message, StorageError> {
        Ok(self.inner.lock().insert_message(message))
    }

    fn get_message(&self, id: MessageId) -> Result<Option<Message>, StorageError> {
        Ok(self.inner.lock().messages.get(&id).cloned())
    }

    fn mark_visible(&self, id: MessageId, sent_at: Timestamp) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let message =
            inner.messages.get_mut(&id).ok_or_else(|| StorageError::NotFound(format!("message {id}")))?;
        message.mark_visible(sent_at);
        Ok(())
    }

    fn create_schedule(
        &self,
        request: NewSchedule,
        now: Timestamp,
    ) -> Result<ScheduledDelivery, StorageError> {
        self.inner.lock().insert_schedule(request, now)
    }

    fn schedule_message(
        &self,
        message: NewMessage,
        scheduled_by: UserId,
        scheduled_at: Timestamp,
        now: Timestamp,
    ) -> Result<(Message, ScheduledDelivery), StorageError> {
        if message.sent_at.is_some() {
            return Err(StorageError::AlreadySent("new message".to_string()));
        }
        let mut inner = self.inner.lock();
        let mut message = inner.insert_message(message);
        let record = inner.insert_schedule(
            NewSchedule {
                message_id: message.id,
                room_id: message.room_id.clone(),
                scheduled_by,
                scheduled_at,
            },
            now,
        )?;
        message.scheduled_at = Some(scheduled_at);
        Ok((message, record))
    }

    fn get_schedule(&self, id: ScheduleId) -> Result<Option<ScheduledDelivery>, StorageError> {
        Ok(self.inner.lock().schedules.get(&id).cloned())
    }

    fn find_schedule_for_message(
        &self,
        message_id: MessageId,
    ) -> Result<Option<ScheduledDelivery>, StorageError> {
        let inner = self.inner.lock();
        Ok(inner.by_message.get(&message_id).and_then(|id| inner.schedules.get(id)).cloned())
    }

    fn conditional_update_status(
        &self,
        id: ScheduleId,
        expected: DeliveryStatus,
        next: DeliveryStatus,
        now: Timestamp,
    ) -> Result<u64, StorageError> {
        if !expected.can_transition_to(next) {
            return Err(StorageError::InvalidTransition { from: expected, to: next });
        }
        let mut inner = self.inner.lock();
        match inner.schedules.get_mut(&id) {
            Some(record) if record.status == expected => {
                record
                    .transition(next, now)
                    .map_err(|_| StorageError::InvalidTransition { from: expected, to: next })?;
                Ok(1)
            },
            _ => Ok(0),
        }
    }

    fn find_overdue(&self, now: Timestamp) -> Result<Vec<ScheduledDelivery>, StorageError> {
        Ok(self.inner.lock().pending_where(|r| r.scheduled_at <= now))
    }

    fn find_scheduled_by_owner(
        &self,
        owner: UserId,
    ) -> Result<Vec<ScheduledDelivery>, StorageError> {
        Ok(self.inner.lock().pending_where(|r| r.scheduled_by == owner))
    }

    fn find_scheduled_by_room(
        &self,
        room: &RoomId,
    ) -> Result<Vec<ScheduledDelivery>, StorageError> {
        Ok(self.inner.lock().pending_where(|r| &r.room_id == room))
    }

    fn purge_terminal_before(&self, cutoff: Timestamp) -> Result<usize, StorageError> {
        let mut inner = self.inner.lock();
        let expired: Vec<_> =
            inner.schedules.values().filter(|r| r.is_expired(cutoff)).map(|r| (r.id, r.message_id)).collect();
        for (id, message_id) in &expired {
            inner.schedules.remove(id);
            inner.by_message.remove(message_id);
        }
        Ok(expired.len())
    }

    fn count_by_status(&self) -> Result<std::collections::BTreeMap<DeliveryStatus, u64>, StorageError> {
        let inner = self.inner.lock();
        let mut counts = empty_counts();
        for record in inner.schedules.values() {
            *counts.entry(record.status).or_default() += 1;
        }
        Ok(counts)
    }
}
