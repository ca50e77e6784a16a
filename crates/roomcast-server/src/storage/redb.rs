//! Redb-backed durable store.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. Redb
//! serializes write transactions, so the read-check-write inside
//! `conditional_update_status` is atomic across every clone and task.

use std::{collections::BTreeMap, fmt::Display, path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use roomcast_core::{DeliveryStatus, Message, NewMessage, NewSchedule, ScheduledDelivery};
use roomcast_proto::{MessageId, RoomId, ScheduleId, Timestamp, UserId};
use serde::{Serialize, de::DeserializeOwned};

use super::{MessageStore, StorageError, empty_counts, sort_schedules};

/// Table: messages
/// Key: message id
/// Value: CBOR-encoded `Message`
const MESSAGES: TableDefinition<u64, &[u8]> = TableDefinition::new("messages");

/// Table: schedules
/// Key: schedule id
/// Value: CBOR-encoded `ScheduledDelivery`
const SCHEDULES: TableDefinition<u64, &[u8]> = TableDefinition::new("schedules");

/// Table: schedule_by_message
/// Key: message id
/// Value: schedule id (one delivery per message)
const SCHEDULE_BY_MESSAGE: TableDefinition<u64, u64> = TableDefinition::new("schedule_by_message");

/// Table: pending_by_time
/// Key: (scheduled_at millis: u64, schedule id: u64) as big-endian bytes [16 bytes]
/// Value: schedule id
///
/// Holds exactly the pending deliveries, so overdue scans are range reads.
const PENDING_BY_TIME: TableDefinition<&[u8], u64> = TableDefinition::new("pending_by_time");

/// Table: counters
/// Key: counter name
/// Value: last id handed out
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

const MESSAGE_COUNTER: &str = "message";
const SCHEDULE_COUNTER: &str = "schedule";

/// Durable store backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates all tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        {
            let _ = txn.open_table(MESSAGES).map_err(io)?;
            let _ = txn.open_table(SCHEDULES).map_err(io)?;
            let _ = txn.open_table(SCHEDULE_BY_MESSAGE).map_err(io)?;
            let _ = txn.open_table(PENDING_BY_TIME).map_err(io)?;
            let _ = txn.open_table(COUNTERS).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Pending deliveries matching `keep`, earliest first.
    fn scan_pending(
        &self,
        keep: impl Fn(&ScheduledDelivery) -> bool,
    ) -> Result<Vec<ScheduledDelivery>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(SCHEDULES).map_err(io)?;

        let mut records = Vec::new();
        for result in table.iter().map_err(io)? {
            let (_, value) = result.map_err(io)?;
            let record: ScheduledDelivery = decode(value.value())?;
            if record.status == DeliveryStatus::Pending && keep(&record) {
                records.push(record);
            }
        }
        sort_schedules(&mut records);
        Ok(records)
    }
}

fn io(err: impl Display) -> StorageError {
    StorageError::Io(err.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn pending_key(scheduled_at: Timestamp, id: ScheduleId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&scheduled_at.as_millis().to_be_bytes());
    key[8..].copy_from_slice(&id.get().to_be_bytes());
    key
}

fn get_record<T, R>(table: &T, id: u64) -> Result<Option<R>, StorageError>
where
    T: ReadableTable<u64, &'static [u8]>,
    R: DeserializeOwned,
{
    table.get(id).map_err(io)?.map(|value| decode(value.value())).transpose()
}

fn next_id(txn: &WriteTransaction, counter: &str) -> Result<u64, StorageError> {
    let mut table = txn.open_table(COUNTERS).map_err(io)?;
    let next = table.get(counter).map_err(io)?.map_or(0, |v| v.value()) + 1;
    table.insert(counter, next).map_err(io)?;
    Ok(next)
}

fn insert_message(txn: &WriteTransaction, new: NewMessage) -> Result<Message, StorageError> {
    let id = next_id(txn, MESSAGE_COUNTER)?;
    let message = Message::from_new(MessageId(id), new);
    let mut table = txn.open_table(MESSAGES).map_err(io)?;
    table.insert(id, encode(&message)?.as_slice()).map_err(io)?;
    Ok(message)
}

fn insert_schedule(
    txn: &WriteTransaction,
    request: NewSchedule,
    now: Timestamp,
) -> Result<ScheduledDelivery, StorageError> {
    {
        let index = txn.open_table(SCHEDULE_BY_MESSAGE).map_err(io)?;
        if index.get(request.message_id.get()).map_err(io)?.is_some() {
            return Err(StorageError::Duplicate(format!(
                "schedule for message {}",
                request.message_id
            )));
        }
    }
    {
        let mut messages = txn.open_table(MESSAGES).map_err(io)?;
        let mut message: Message = get_record(&messages, request.message_id.get())?
            .ok_or_else(|| StorageError::NotFound(format!("message {}", request.message_id)))?;
        if message.is_visible() {
            return Err(StorageError::AlreadySent(format!("message {}", request.message_id)));
        }
        message.scheduled_at = Some(request.scheduled_at);
        messages.insert(message.id.get(), encode(&message)?.as_slice()).map_err(io)?;
    }

    let id = ScheduleId(next_id(txn, SCHEDULE_COUNTER)?);
    let record = ScheduledDelivery::pending(id, request, now);
    {
        let mut schedules = txn.open_table(SCHEDULES).map_err(io)?;
        schedules.insert(id.get(), encode(&record)?.as_slice()).map_err(io)?;
    }
    {
        let mut index = txn.open_table(SCHEDULE_BY_MESSAGE).map_err(io)?;
        index.insert(record.message_id.get(), id.get()).map_err(io)?;
    }
    {
        let mut pending = txn.open_table(PENDING_BY_TIME).map_err(io)?;
        pending.insert(pending_key(record.scheduled_at, id).as_slice(), id.get()).map_err(io)?;
    }
    Ok(record)
}

impl MessageStore for RedbStore {
    fn create_message(&self, message: NewMessage) -> Result<Message, StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        let message = insert_message(&txn, message)?;
        txn.commit().map_err(io)?;
        Ok(message)
    }

    fn get_message(&self, id: MessageId) -> Result<Option<Message>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(MESSAGES).map_err(io)?;
        get_record(&table, id.get())
    }

    fn mark_visible(&self, id: MessageId, sent_at: Timestamp) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(MESSAGES).map_err(io)?;
            let mut message: Message = get_record(&table, id.get())?
                .ok_or_else(|| StorageError::NotFound(format!("message {id}")))?;
            message.mark_visible(sent_at);
            table.insert(id.get(), encode(&message)?.as_slice()).map_err(io)?;
        }
        txn.commit().map_err(io)?;
        Ok(())
    }

    fn create_schedule(
        &self,
        request: NewSchedule,
        now: Timestamp,
    ) -> Result<ScheduledDelivery, StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        let record = insert_schedule(&txn, request, now)?;
        txn.commit().map_err(io)?;
        Ok(record)
    }

    fn schedule_message(
        &self,
        message: NewMessage,
        scheduled_by: UserId,
        scheduled_at: Timestamp,
        now: Timestamp,
    ) -> Result<(Message, ScheduledDelivery), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        let mut message = insert_message(&txn, message)?;
        let record = insert_schedule(
            &txn,
            NewSchedule {
                message_id: message.id,
                room_id: message.room_id.clone(),
                scheduled_by,
                scheduled_at,
            },
            now,
        )?;
        txn.commit().map_err(io)?;

        message.scheduled_at = Some(scheduled_at);
        Ok((message, record))
    }

    fn get_schedule(&self, id: ScheduleId) -> Result<Option<ScheduledDelivery>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(SCHEDULES).map_err(io)?;
        get_record(&table, id.get())
    }

    fn find_schedule_for_message(
        &self,
        message_id: MessageId,
    ) -> Result<Option<ScheduledDelivery>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let index = txn.open_table(SCHEDULE_BY_MESSAGE).map_err(io)?;
        let Some(id) = index.get(message_id.get()).map_err(io)?.map(|v| v.value()) else {
            return Ok(None);
        };
        let table = txn.open_table(SCHEDULES).map_err(io)?;
        get_record(&table, id)
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

        let txn = self.db.begin_write().map_err(io)?;
        let scheduled_at = {
            let mut table = txn.open_table(SCHEDULES).map_err(io)?;
            let Some(mut record) = get_record::<_, ScheduledDelivery>(&table, id.get())? else {
                return Ok(0);
            };
            if record.status != expected {
                return Ok(0);
            }
            record
                .transition(next, now)
                .map_err(|_| StorageError::InvalidTransition { from: expected, to: next })?;
            table.insert(id.get(), encode(&record)?.as_slice()).map_err(io)?;
            record.scheduled_at
        };
        {
            let mut pending = txn.open_table(PENDING_BY_TIME).map_err(io)?;
            pending.remove(pending_key(scheduled_at, id).as_slice()).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(1)
    }

    fn find_overdue(&self, now: Timestamp) -> Result<Vec<ScheduledDelivery>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let pending = txn.open_table(PENDING_BY_TIME).map_err(io)?;
        let schedules = txn.open_table(SCHEDULES).map_err(io)?;

        let start = pending_key(Timestamp::EPOCH, ScheduleId(0));
        let end = pending_key(now, ScheduleId(u64::MAX));

        let mut records = Vec::new();
        for result in pending.range(start.as_slice()..=end.as_slice()).map_err(io)? {
            let (_, value) = result.map_err(io)?;
            if let Some(record) = get_record::<_, ScheduledDelivery>(&schedules, value.value())? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn find_scheduled_by_owner(
        &self,
        owner: UserId,
    ) -> Result<Vec<ScheduledDelivery>, StorageError> {
        self.scan_pending(|r| r.scheduled_by == owner)
    }

    fn find_scheduled_by_room(
        &self,
        room: &RoomId,
    ) -> Result<Vec<ScheduledDelivery>, StorageError> {
        self.scan_pending(|r| &r.room_id == room)
    }

    fn purge_terminal_before(&self, cutoff: Timestamp) -> Result<usize, StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        let expired = {
            let table = txn.open_table(SCHEDULES).map_err(io)?;
            let mut expired = Vec::new();
            for result in table.iter().map_err(io)? {
                let (_, value) = result.map_err(io)?;
                let record: ScheduledDelivery = decode(value.value())?;
                if record.is_expired(cutoff) {
                    expired.push((record.id, record.message_id));
                }
            }
            expired
        };
        {
            let mut schedules = txn.open_table(SCHEDULES).map_err(io)?;
            let mut index = txn.open_table(SCHEDULE_BY_MESSAGE).map_err(io)?;
            for (id, message_id) in &expired {
                schedules.remove(id.get()).map_err(io)?;
                index.remove(message_id.get()).map_err(io)?;
            }
        }
        txn.commit().map_err(io)?;

        Ok(expired.len())
    }

    fn count_by_status(&self) -> Result<BTreeMap<DeliveryStatus, u64>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(SCHEDULES).map_err(io)?;

        let mut counts = empty_counts();
        for result in table.iter().map_err(io)? {
            let (_, value) = result.map_err(io)?;
            let record: ScheduledDelivery = decode(value.value())?;
            *counts.entry(record.status).or_default() += 1;
        }
        Ok(counts)
    }
}
