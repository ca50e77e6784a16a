//! Scheduled delivery engine.
//!
//! Deferred messages are stored hidden alongside a pending
//! [`ScheduledDelivery`]. Two independent paths bring them to life:
//!
//! - **Timers**: one tokio task per record, sleeping until `scheduled_at`.
//!   Best effort, lost on restart.
//! - **Recovery sweep**: on start and every `sweep_interval`, every pending
//!   record that is due gets fired. Records due before the next sweep get a
//!   timer if they have none.
//!
//! Both paths call the same [`DeliveryEngine::fire`]. The store's
//! compare-and-set on status is the only synchronization: of any number of
//! fires and cancels racing on one record, exactly one moves it out of
//! `pending`, and only a fire that won the transition publishes.
//!
//! # Fire sequence
//!
//! ```text
//! get_schedule ──> terminal? ──> done
//!      │
//!      ├─> not due yet ──> report remaining delay
//!      │
//!      ├─> message missing ──> CAS pending→failed
//!      │
//!      └─> CAS pending→sent ──0 rows──> lost race, done
//!               │ 1 row
//!               ▼
//!          mark_visible + broadcast newMessage   (errors logged only)
//! ```

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use roomcast_core::{
    DeliveryError, DeliveryStatus, Environment, Message, NewMessage, NewSchedule,
    ScheduledDelivery,
};
use roomcast_proto::{
    Event, MessageId, RoomId, ScheduleId, ScheduledItem, Timestamp, UserId,
};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{broadcaster::Broadcaster, config::DeliveryConfig, storage::MessageStore};

/// Window used for the upcoming-deliveries counter.
const UPCOMING_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Result of one [`DeliveryEngine::fire`] attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    /// No such record (purged or never existed)
    Missing,
    /// Record already left `pending` before this attempt looked at it
    AlreadyTerminal(DeliveryStatus),
    /// Delivery time not reached; retry after the given delay
    NotDue(Duration),
    /// Another fire or a cancel moved the record first
    LostRace,
    /// The message vanished; the record is now `failed`
    Failed {
        /// Message that could not be found
        message_id: MessageId,
    },
    /// This attempt won the transition and published the message
    Delivered {
        /// Published message
        message_id: MessageId,
        /// Connections the broadcast reached
        recipients: usize,
    },
}

/// Result of one recovery sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Pending records examined
    pub examined: usize,
    /// Records this sweep published
    pub delivered: usize,
    /// Timers armed for records due before the next sweep
    pub armed: usize,
    /// Fires that failed with a store error
    pub errors: usize,
}

/// Delivery counters for dashboards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStatistics {
    /// Records in each status; every status is present
    pub by_status: BTreeMap<DeliveryStatus, u64>,
    /// Pending records
    pub total_pending: u64,
    /// Pending records due after now and within the next 24 hours
    pub upcoming_24h: u64,
}

/// Exactly-once publisher of scheduled messages.
///
/// Cheap to clone; clones share timers and store.
pub struct DeliveryEngine<E: Environment, S: MessageStore> {
    inner: Arc<Inner<E, S>>,
}

impl<E: Environment, S: MessageStore> Clone for DeliveryEngine<E, S> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct Inner<E, S> {
    env: E,
    store: S,
    broadcaster: Broadcaster,
    timers: DashMap<ScheduleId, AbortHandle>,
    config: DeliveryConfig,
}

impl<E: Environment, S: MessageStore> DeliveryEngine<E, S> {
    /// Engine over `store`, publishing through `broadcaster`.
    pub fn new(env: E, store: S, broadcaster: Broadcaster, config: DeliveryConfig) -> Self {
        Self { inner: Arc::new(Inner { env, store, broadcaster, timers: DashMap::new(), config }) }
    }

    /// Backing store.
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Persist a hidden message and its pending delivery, then arm a timer.
    ///
    /// A `scheduled_at` in the past is accepted and fires through the
    /// regular path right away.
    ///
    /// # Errors
    ///
    /// `DeliveryError::StoreUnavailable` if the store fails. Nothing is
    /// persisted in that case.
    pub fn schedule_new(
        &self,
        room_id: RoomId,
        sender: UserId,
        content: String,
        kind: String,
        scheduled_at: Timestamp,
    ) -> Result<(Message, ScheduledDelivery), DeliveryError> {
        let now = self.inner.env.wall_clock();
        let message = NewMessage { room_id, sender_id: sender, content, kind, created_at: now, sent_at: None };
        let (message, record) =
            self.inner.store.schedule_message(message, sender, scheduled_at, now)?;

        tracing::info!(
            message_id = %message.id,
            room = %record.room_id,
            %scheduled_at,
            "message scheduled"
        );
        self.arm(&record);
        Ok((message, record))
    }

    /// Defer an already persisted, hidden message.
    ///
    /// # Errors
    ///
    /// - `DeliveryError::NotFound` if the message does not exist
    /// - `DeliveryError::Conflict` if it already has a delivery record, or
    ///   with `Sent` if it is already visible
    /// - `DeliveryError::StoreUnavailable` if the store fails
    pub fn schedule(
        &self,
        message_id: MessageId,
        scheduled_by: UserId,
        scheduled_at: Timestamp,
    ) -> Result<ScheduledDelivery, DeliveryError> {
        let store = &self.inner.store;
        let message = store
            .get_message(message_id)?
            .ok_or_else(|| DeliveryError::NotFound(format!("message {message_id}")))?;
        if message.is_visible() {
            return Err(DeliveryError::Conflict { status: DeliveryStatus::Sent });
        }
        if let Some(existing) = store.find_schedule_for_message(message_id)? {
            return Err(DeliveryError::Conflict { status: existing.status });
        }

        let request = NewSchedule { message_id, room_id: message.room_id, scheduled_by, scheduled_at };
        let record = store.create_schedule(request, self.inner.env.wall_clock())?;
        self.arm(&record);
        Ok(record)
    }

    /// Withdraw a pending delivery. Only its owner may cancel.
    ///
    /// # Errors
    ///
    /// - `DeliveryError::NotFound` if `requester` owns no delivery for the
    ///   message
    /// - `DeliveryError::Conflict` carrying the current status if the record
    ///   already left `pending`, including when a fire wins the race
    /// - `DeliveryError::StoreUnavailable` if the store fails
    pub fn cancel(
        &self,
        message_id: MessageId,
        requester: UserId,
    ) -> Result<ScheduledDelivery, DeliveryError> {
        let store = &self.inner.store;
        let not_found = || DeliveryError::NotFound(format!("scheduled message {message_id}"));

        let record = store
            .find_schedule_for_message(message_id)?
            .filter(|record| record.scheduled_by == requester)
            .ok_or_else(not_found)?;
        if record.status != DeliveryStatus::Pending {
            return Err(DeliveryError::Conflict { status: record.status });
        }

        let now = self.inner.env.wall_clock();
        let rows = store.conditional_update_status(
            record.id,
            DeliveryStatus::Pending,
            DeliveryStatus::Cancelled,
            now,
        )?;
        if rows == 0 {
            let current = store.get_schedule(record.id)?.ok_or_else(not_found)?;
            tracing::warn!(%message_id, status = %current.status, "cancel lost race");
            return Err(DeliveryError::Conflict { status: current.status });
        }

        if let Some((_, timer)) = self.inner.timers.remove(&record.id) {
            timer.abort();
        }
        tracing::info!(%message_id, "scheduled message cancelled");

        let mut cancelled = record;
        cancelled.status = DeliveryStatus::Cancelled;
        cancelled.updated_at = now;
        Ok(cancelled)
    }

    /// Try to publish one delivery.
    ///
    /// Safe to call any number of times, concurrently, from timers and
    /// sweeps alike: at most one call ever returns
    /// [`FireOutcome::Delivered`] for a record.
    ///
    /// # Errors
    ///
    /// `DeliveryError::StoreUnavailable` if the store fails before the
    /// status transition. Failures after it are logged and not returned.
    pub fn fire(&self, id: ScheduleId) -> Result<FireOutcome, DeliveryError> {
        let store = &self.inner.store;
        let now = self.inner.env.wall_clock();

        let Some(record) = store.get_schedule(id)? else {
            return Ok(FireOutcome::Missing);
        };
        if record.status.is_terminal() {
            return Ok(FireOutcome::AlreadyTerminal(record.status));
        }
        if !record.is_due(now) {
            return Ok(FireOutcome::NotDue(record.delay_from(now)));
        }

        let Some(message) = store.get_message(record.message_id)? else {
            let rows = store.conditional_update_status(
                id,
                DeliveryStatus::Pending,
                DeliveryStatus::Failed,
                now,
            )?;
            if rows == 0 {
                return Ok(FireOutcome::LostRace);
            }
            tracing::warn!(message_id = %record.message_id, "scheduled message missing, delivery failed");
            return Ok(FireOutcome::Failed { message_id: record.message_id });
        };

        let rows =
            store.conditional_update_status(id, DeliveryStatus::Pending, DeliveryStatus::Sent, now)?;
        if rows == 0 {
            tracing::debug!(message_id = %record.message_id, "fire lost race");
            return Ok(FireOutcome::LostRace);
        }

        let recipients = self.publish(&record, message, now);
        Ok(FireOutcome::Delivered { message_id: record.message_id, recipients })
    }

    /// Fire everything overdue and arm timers for what is due before the
    /// next sweep.
    ///
    /// # Errors
    ///
    /// `DeliveryError::StoreUnavailable` if the overdue query fails.
    /// Individual fire failures are counted in the report.
    pub fn sweep(&self) -> Result<SweepReport, DeliveryError> {
        let now = self.inner.env.wall_clock();
        let horizon = now.saturating_add(self.inner.config.sweep_interval);
        let candidates = self.inner.store.find_overdue(horizon)?;

        let mut report = SweepReport { examined: candidates.len(), ..SweepReport::default() };
        for record in candidates {
            if !record.is_due(now) {
                if self.arm(&record) {
                    report.armed += 1;
                }
                continue;
            }
            match self.fire(record.id) {
                Ok(FireOutcome::Delivered { .. }) => report.delivered += 1,
                Ok(_) => {},
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(message_id = %record.message_id, error = %e, "sweep fire failed");
                },
            }
        }
        Ok(report)
    }

    /// Delete terminal records older than the retention period.
    ///
    /// # Errors
    ///
    /// `DeliveryError::StoreUnavailable` if the store fails.
    pub fn purge_expired(&self) -> Result<usize, DeliveryError> {
        let cutoff = self.inner.env.wall_clock().saturating_sub(self.inner.config.retention);
        let purged = self.inner.store.purge_terminal_before(cutoff)?;
        if purged > 0 {
            tracing::info!(purged, %cutoff, "expired deliveries purged");
        }
        Ok(purged)
    }

    /// Pending deliveries owned by `owner`, earliest first.
    ///
    /// # Errors
    ///
    /// `DeliveryError::StoreUnavailable` if the store fails.
    pub fn scheduled_for(&self, owner: UserId) -> Result<Vec<ScheduledItem>, DeliveryError> {
        let store = &self.inner.store;
        let records = store.find_scheduled_by_owner(owner)?;
        let mut items = Vec::with_capacity(records.len());
        for record in records {
            if let Some(message) = store.get_message(record.message_id)? {
                items.push(record.to_item(message.content));
            }
        }
        Ok(items)
    }

    /// Pending deliveries targeting `room`, earliest first.
    ///
    /// # Errors
    ///
    /// `DeliveryError::StoreUnavailable` if the store fails.
    pub fn scheduled_for_room(&self, room: &RoomId) -> Result<Vec<ScheduledDelivery>, DeliveryError> {
        Ok(self.inner.store.find_scheduled_by_room(room)?)
    }

    /// Per-status counters.
    ///
    /// # Errors
    ///
    /// `DeliveryError::StoreUnavailable` if the store fails.
    pub fn statistics(&self) -> Result<SchedulerStatistics, DeliveryError> {
        let by_status = self.inner.store.count_by_status()?;
        let total_pending = by_status.get(&DeliveryStatus::Pending).copied().unwrap_or(0);
        let now = self.inner.env.wall_clock();
        let horizon = now.saturating_add(UPCOMING_WINDOW);
        let upcoming_24h =
            self.inner.store.find_overdue(horizon)?.iter().filter(|r| r.scheduled_at > now).count() as u64;
        Ok(SchedulerStatistics { by_status, total_pending, upcoming_24h })
    }

    /// Timers currently armed.
    pub fn armed_timers(&self) -> usize {
        self.inner.timers.len()
    }

    /// Run the recovery sweep now and then every `sweep_interval` until
    /// `shutdown` is cancelled.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        let interval = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            loop {
                match engine.sweep() {
                    Ok(report) if report.delivered > 0 || report.errors > 0 => {
                        tracing::info!(
                            delivered = report.delivered,
                            armed = report.armed,
                            errors = report.errors,
                            "recovery sweep"
                        );
                    },
                    Ok(_) => {},
                    Err(e) => tracing::error!(error = %e, "recovery sweep failed"),
                }
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = engine.inner.env.sleep(interval) => {},
                }
            }
            tracing::debug!("recovery sweep stopped");
        })
    }

    /// Purge expired records every `cleanup_interval` until `shutdown` is
    /// cancelled.
    pub fn spawn_cleanup(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        let interval = self.inner.config.cleanup_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = engine.inner.env.sleep(interval) => {},
                }
                if let Err(e) = engine.purge_expired() {
                    tracing::error!(error = %e, "retention cleanup failed");
                }
            }
            tracing::debug!("retention cleanup stopped");
        })
    }

    /// Arm a timer for `record` unless one is already running.
    fn arm(&self, record: &ScheduledDelivery) -> bool {
        let Entry::Vacant(slot) = self.inner.timers.entry(record.id) else {
            return false;
        };

        let engine = self.clone();
        let id = record.id;
        let mut delay = record.delay_from(self.inner.env.wall_clock());
        // The entry stays locked until the handle is stored, so the task's
        // own removal below always finds it.
        let task = tokio::spawn(async move {
            loop {
                engine.inner.env.sleep(delay).await;
                match engine.fire(id) {
                    Ok(FireOutcome::NotDue(remaining)) => delay = remaining,
                    Ok(_) => break,
                    Err(e) => {
                        tracing::warn!(schedule = %id, error = %e, "timer fire failed, sweep will retry");
                        break;
                    },
                }
            }
            engine.inner.timers.remove(&id);
        });
        slot.insert(task.abort_handle());
        true
    }

    fn publish(&self, record: &ScheduledDelivery, mut message: Message, now: Timestamp) -> usize {
        if let Err(e) = self.inner.store.mark_visible(message.id, now) {
            tracing::error!(message_id = %message.id, error = %e, "failed to mark delivered message visible");
        }
        message.mark_visible(now);

        let event = Event::NewMessage { message: message.to_view(Some(record.scheduled_by)) };
        let broadcaster = &self.inner.broadcaster;
        let report = match record.room_id.pair_members() {
            Some((a, b)) => broadcaster.broadcast_to_pair(a, b, event),
            None => broadcaster.broadcast_to_room(&record.room_id, event),
        };

        tracing::info!(
            message_id = %message.id,
            room = %record.room_id,
            recipients = report.delivered,
            "scheduled message delivered"
        );
        report.delivered
    }
}
