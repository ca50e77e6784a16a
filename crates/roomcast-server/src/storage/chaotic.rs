//! Chaotic store wrapper for fault injection testing.
//!
//! Randomly fails operations to exercise error handling and recovery. Chaos
//! tests run the delivery engine against it and check that retries never
//! deliver a message twice.

use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use roomcast_core::{DeliveryStatus, Message, NewMessage, NewSchedule, ScheduledDelivery};
use roomcast_proto::{MessageId, RoomId, ScheduleId, Timestamp, UserId};

use super::{MessageStore, StorageError};

/// Store wrapper that randomly injects `StorageError::Io` failures.
///
/// A failed call never reaches the inner store. The failure rate can be
/// changed while the wrapper is shared, so a test can run a chaotic phase
/// and then let the system heal.
#[derive(Clone)]
pub struct ChaoticStore<S: MessageStore> {
    inner: S,
    /// Failure rate as `f64` bits (0.0 = never fail, 1.0 = always fail)
    failure_rate: Arc<AtomicU64>,
    rng: Arc<Mutex<ChaoticRng>>,
    operation_count: Arc<AtomicUsize>,
    injected_count: Arc<AtomicUsize>,
}

/// Linear congruential generator; reproducible for a given seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // Numerical Recipes constants
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: MessageStore> ChaoticStore<S> {
    /// Wrap `inner` with a fixed default seed.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Wrap `inner` with an explicit seed for reproducible chaos.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert_rate(failure_rate);
        Self {
            inner,
            failure_rate: Arc::new(AtomicU64::new(failure_rate.to_bits())),
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            operation_count: Arc::new(AtomicUsize::new(0)),
            injected_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Change the failure rate for every clone.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn set_failure_rate(&self, failure_rate: f64) {
        assert_rate(failure_rate);
        self.failure_rate.store(failure_rate.to_bits(), Ordering::SeqCst);
    }

    /// Underlying store, for checking invariants after chaos.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of operations attempted.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::SeqCst)
    }

    /// Number of operations that were failed on purpose.
    pub fn injected_count(&self) -> usize {
        self.injected_count.load(Ordering::SeqCst)
    }

    /// Count the operation and decide whether it fails.
    fn inject(&self) -> Result<(), StorageError> {
        self.operation_count.fetch_add(1, Ordering::SeqCst);
        let rate = f64::from_bits(self.failure_rate.load(Ordering::SeqCst));
        if self.rng.lock().next() < rate {
            self.injected_count.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }
        Ok(())
    }
}

fn assert_rate(failure_rate: f64) {
    assert!(
        (0.0..=1.0).contains(&failure_rate),
        "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
    );
}

impl<S: MessageStore> MessageStore for ChaoticStore<S> {
    fn create_message(&self, message: NewMessage) -> Result<Message, StorageError> {
        self.inject()?;
        self.inner.create_message(message)
    }

    fn get_message(&self, id: MessageId) -> Result<Option<Message>, StorageError> {
        self.inject()?;
        self.inner.get_message(id)
    }

    fn mark_visible(&self, id: MessageId, sent_at: Timestamp) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.mark_visible(id, sent_at)
    }

    fn create_schedule(
        &self,
        request: NewSchedule,
        now: Timestamp,
    ) -> Result<ScheduledDelivery, StorageError> {
        self.inject()?;
        self.inner.create_schedule(request, now)
    }

    fn schedule_message(
        &self,
        message: NewMessage,
        scheduled_by: UserId,
        scheduled_at: Timestamp,
        now: Timestamp,
    ) -> Result<(Message, ScheduledDelivery), StorageError> {
        self.inject()?;
        self.inner.schedule_message(message, scheduled_by, scheduled_at, now)
    }

    fn get_schedule(&self, id: ScheduleId) -> Result<Option<ScheduledDelivery>, StorageError> {
        self.inject()?;
        self.inner.get_schedule(id)
    }

    fn find_schedule_for_message(
        &self,
        message_id: MessageId,
    ) -> Result<Option<ScheduledDelivery>, StorageError> {
        self.inject()?;
        self.inner.find_schedule_for_message(message_id)
    }

    fn conditional_update_status(
        &self,
        id: ScheduleId,
        expected: DeliveryStatus,
        next: DeliveryStatus,
        now: Timestamp,
    ) -> Result<u64, StorageError> {
        self.inject()?;
        self.inner.conditional_update_status(id, expected, next, now)
    }

    fn find_overdue(&self, now: Timestamp) -> Result<Vec<ScheduledDelivery>, StorageError> {
        self.inject()?;
        self.inner.find_overdue(now)
    }

    fn find_scheduled_by_owner(
        &self,
        owner: UserId,
    ) -> Result<Vec<ScheduledDelivery>, StorageError> {
        self.inject()?;
        self.inner.find_scheduled_by_owner(owner)
    }

    fn find_scheduled_by_room(
        &self,
        room: &RoomId,
    ) -> Result<Vec<ScheduledDelivery>, StorageError> {
        self.inject()?;
        self.inner.find_scheduled_by_room(room)
    }

    fn purge_terminal_before(&self, cutoff: Timestamp) -> Result<usize, StorageError> {
        self.inject()?;
        self.inner.purge_terminal_before(cutoff)
    }

    fn count_by_status(
        &self,
    ) -> Result<std::collections::BTreeMap<DeliveryStatus, u64>, StorageError> {
        self.inject()?;
        self.inner.count_by_status()
    }
}
