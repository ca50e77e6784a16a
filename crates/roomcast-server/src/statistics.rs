//! Periodic statistics fan-out.
//!
//! A single ticker recomputes a [`StatisticsSnapshot`] from an
//! [`AggregateSource`], swaps it in as the current snapshot and broadcasts it
//! to every connection. The periodic tick and on-demand refreshes share one
//! async mutex, so recomputations never interleave and broadcasts leave in
//! the order their snapshots were computed.
//!
//! A failed recomputation changes nothing: the previous snapshot stays
//! current, nothing is broadcast, and the next tick retries.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use roomcast_core::Environment;
use roomcast_proto::{Event, StatisticsSnapshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{broadcaster::Broadcaster, registry::ConnectionRegistry, storage::StorageError};

/// Read-only aggregate counts feeding the snapshot.
#[async_trait]
pub trait AggregateSource: Send + Sync + 'static {
    /// Identities active in the reporting window.
    async fn active_users(&self) -> Result<u64, StorageError>;

    /// Completed sessions in the reporting window.
    async fn completed_sessions(&self) -> Result<u64, StorageError>;

    /// Completed tasks in the reporting window.
    async fn completed_tasks(&self) -> Result<u64, StorageError>;

    /// Achievements earned in the reporting window.
    async fn achievements(&self) -> Result<u64, StorageError>;
}

/// Settable in-process counters.
#[derive(Debug, Clone, Default)]
pub struct MemoryAggregates {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    active_users: AtomicU64,
    completed_sessions: AtomicU64,
    completed_tasks: AtomicU64,
    achievements: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryAggregates {
    /// All counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set every counter at once.
    pub fn set(&self, active_users: u64, completed_sessions: u64, completed_tasks: u64, achievements: u64) {
        self.inner.active_users.store(active_users, Ordering::SeqCst);
        self.inner.completed_sessions.store(completed_sessions, Ordering::SeqCst);
        self.inner.completed_tasks.store(completed_tasks, Ordering::SeqCst);
        self.inner.achievements.store(achievements, Ordering::SeqCst);
    }

    /// Count one completed session.
    pub fn record_session(&self) {
        self.inner.completed_sessions.fetch_add(1, Ordering::SeqCst);
    }

    /// Count one completed task.
    pub fn record_task(&self) {
        self.inner.completed_tasks.fetch_add(1, Ordering::SeqCst);
    }

    /// Count one achievement.
    pub fn record_achievement(&self) {
        self.inner.achievements.fetch_add(1, Ordering::SeqCst);
    }

    /// Make every query fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn read(&self, counter: &AtomicU64) -> Result<u64, StorageError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Io("aggregate source unavailable".to_string()));
        }
        Ok(counter.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl AggregateSource for MemoryAggregates {
    async fn active_users(&self) -> Result<u64, StorageError> {
        self.read(&self.inner.active_users)
    }

    async fn completed_sessions(&self) -> Result<u64, StorageError> {
        self.read(&self.inner.completed_sessions)
    }

    async fn completed_tasks(&self) -> Result<u64, StorageError> {
        self.read(&self.inner.completed_tasks)
    }

    async fn achievements(&self) -> Result<u64, StorageError> {
        self.read(&self.inner.achievements)
    }
}

/// Live source: active users are the identities currently connected, the
/// remaining counters come from [`MemoryAggregates`].
#[derive(Clone)]
pub struct RegistryAggregates {
    registry: Arc<ConnectionRegistry>,
    counters: MemoryAggregates,
}

impl RegistryAggregates {
    /// Source over `registry` and `counters`.
    pub fn new(registry: Arc<ConnectionRegistry>, counters: MemoryAggregates) -> Self {
        Self { registry, counters }
    }
}

#[async_trait]
impl AggregateSource for RegistryAggregates {
    async fn active_users(&self) -> Result<u64, StorageError> {
        Ok(self.registry.identity_count() as u64)
    }

    async fn completed_sessions(&self) -> Result<u64, StorageError> {
        self.counters.completed_sessions().await
    }

    async fn completed_tasks(&self) -> Result<u64, StorageError> {
        self.counters.completed_tasks().await
    }

    async fn achievements(&self) -> Result<u64, StorageError> {
        self.counters.achievements().await
    }
}

/// Recompute-and-broadcast loop over one [`AggregateSource`].
pub struct StatisticsLoop<E: Environment> {
    inner: Arc<LoopInner<E>>,
}

impl<E: Environment> Clone for StatisticsLoop<E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct LoopInner<E> {
    env: E,
    source: Arc<dyn AggregateSource>,
    broadcaster: Broadcaster,
    current: RwLock<StatisticsSnapshot>,
    refresh: tokio::sync::Mutex<()>,
    interval: Duration,
}

impl<E: Environment> StatisticsLoop<E> {
    /// Loop ticking every `interval`. The current snapshot starts zeroed.
    pub fn new(
        env: E,
        source: Arc<dyn AggregateSource>,
        broadcaster: Broadcaster,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(LoopInner {
                env,
                source,
                broadcaster,
                current: RwLock::new(StatisticsSnapshot::default()),
                refresh: tokio::sync::Mutex::new(()),
                interval,
            }),
        }
    }

    /// Snapshot last computed successfully.
    pub fn current(&self) -> StatisticsSnapshot {
        self.inner.current.read().clone()
    }

    /// Recompute, swap in and broadcast to every connection.
    ///
    /// This is the on-demand refresh; the periodic tick runs the same
    /// routine.
    ///
    /// # Errors
    ///
    /// Returns the source failure. The current snapshot is unchanged and
    /// nothing was broadcast.
    pub async fn refresh_now(&self) -> Result<StatisticsSnapshot, StorageError> {
        let _serialized = self.inner.refresh.lock().await;

        let snapshot = self.compute().await?;
        *self.inner.current.write() = snapshot.clone();

        let report = self
            .inner
            .broadcaster
            .broadcast_to_all(Event::StatisticsUpdated { statistics: snapshot.clone() }, None);
        tracing::debug!(recipients = report.delivered, "statistics broadcast");
        Ok(snapshot)
    }

    /// Refresh now and then every `interval` until `shutdown` is cancelled.
    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let stats = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = stats.refresh_now().await {
                    tracing::error!(error = %e, "statistics refresh failed, keeping previous snapshot");
                }
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = stats.inner.env.sleep(stats.inner.interval) => {},
                }
            }
            tracing::debug!("statistics loop stopped");
        })
    }

    async fn compute(&self) -> Result<StatisticsSnapshot, StorageError> {
        let source = &self.inner.source;
        Ok(StatisticsSnapshot {
            active_users: source.active_users().await?,
            completed_sessions: source.completed_sessions().await?,
            completed_tasks: source.completed_tasks().await?,
            achievements: source.achievements().await?,
            computed_at: Some(self.inner.env.wall_clock()),
        })
    }
}

#[cfg(test)]
mod tests {
    use roomcast_harness::{SimEnv, TestPeer};
    use roomcast_proto::{ConnectionId, Timestamp, UserId};

    use super::*;

    fn stats_loop(source: MemoryAggregates) -> (Arc<ConnectionRegistry>, StatisticsLoop<SimEnv>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let stats = StatisticsLoop::new(
            SimEnv::new(),
            Arc::new(source),
            Broadcaster::new(Arc::clone(&registry)),
            Duration::from_secs(30),
        );
        (registry, stats)
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_swaps_and_broadcasts() {
        let source = MemoryAggregates::new();
        source.set(3, 10, 20, 1);
        let (registry, stats) = stats_loop(source);
        let (tx, mut peer) = TestPeer::channel(ConnectionId(1), 4);
        registry.register(ConnectionId(1), None, tx, Timestamp::EPOCH);

        let snapshot = stats.refresh_now().await.unwrap();

        assert_eq!(snapshot.active_users, 3);
        assert!(snapshot.computed_at.is_some());
        assert_eq!(stats.current(), snapshot);
        assert_eq!(peer.drain(), vec![Event::StatisticsUpdated { statistics: snapshot }]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_previous_snapshot() {
        let source = MemoryAggregates::new();
        source.set(1, 2, 3, 4);
        let (registry, stats) = stats_loop(source.clone());
        let (tx, mut peer) = TestPeer::channel(ConnectionId(1), 4);
        registry.register(ConnectionId(1), None, tx, Timestamp::EPOCH);
        let before = stats.refresh_now().await.unwrap();
        peer.drain();

        source.set_unavailable(true);
        source.set(9, 9, 9, 9);

        assert!(stats.refresh_now().await.is_err());
        assert_eq!(stats.current(), before);
        assert!(peer.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_broadcasts_each_interval() {
        let (registry, stats) = stats_loop(MemoryAggregates::new());
        let (tx, mut peer) = TestPeer::channel(ConnectionId(1), 8);
        registry.register(ConnectionId(1), None, tx, Timestamp::EPOCH);
        let shutdown = CancellationToken::new();

        let task = stats.spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_secs(95)).await;
        shutdown.cancel();
        task.await.unwrap();

        // Immediately, then at 30s, 60s and 90s
        assert_eq!(peer.count(|e| matches!(e, Event::StatisticsUpdated { .. })), 4);
    }

    #[tokio::test]
    async fn registry_source_counts_connected_identities() {
        let registry = Arc::new(ConnectionRegistry::new());
        for (id, user) in [(1, Some(5)), (2, Some(5)), (3, None)] {
            let (tx, _rx) = tokio::sync::mpsc::channel(1);
            registry.register(ConnectionId(id), user.map(UserId), tx, Timestamp::EPOCH);
        }
        let counters = MemoryAggregates::new();
        counters.record_task();
        let source = RegistryAggregates::new(registry, counters);

        assert_eq!(source.active_users().await.unwrap(), 1);
        assert_eq!(source.completed_tasks().await.unwrap(), 1);
    }
}
