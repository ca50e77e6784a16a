//! Simulated environment.
//!
//! Monotonic time is tokio's clock, which tests pause with
//! `#[tokio::test(start_paused = true)]`. Wall-clock time is derived from it:
//!
//! ```text
//! wall_clock = epoch + (tokio::Instant::now() - origin) + skew
//! ```
//!
//! `skew` only grows, through [`SimEnv::advance_wall_clock`]. Bumping it
//! without elapsing tokio time models a server that was down while deliveries
//! came due: the wall clock moves, but no timer fires.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use roomcast_core::Environment;
use roomcast_proto::Timestamp;
use tokio::time::Instant;

/// Wall-clock reading at `origin` unless overridden: 2023-11-14T22:13:20Z.
pub const DEFAULT_EPOCH: Timestamp = Timestamp::from_millis(1_700_000_000_000);

/// Deterministic environment for tests.
///
/// Clones share one clock and one RNG.
#[derive(Clone)]
pub struct SimEnv {
    inner: Arc<Inner>,
}

struct Inner {
    origin: Instant,
    epoch: Timestamp,
    skew_ms: AtomicU64,
    rng: Mutex<ChaCha8Rng>,
}

impl SimEnv {
    /// Environment with a fixed seed and [`DEFAULT_EPOCH`].
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment with an explicit RNG seed.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_epoch(seed, DEFAULT_EPOCH)
    }

    /// Environment whose wall clock reads `epoch` right now.
    pub fn with_epoch(seed: u64, epoch: Timestamp) -> Self {
        Self {
            inner: Arc::new(Inner {
                origin: Instant::now(),
                epoch,
                skew_ms: AtomicU64::new(0),
                rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            }),
        }
    }

    /// Move the wall clock forward without elapsing monotonic time.
    pub fn advance_wall_clock(&self, by: Duration) {
        let millis = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.inner.skew_ms.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for SimEnv {
    type Instant = Instant;

    fn now(&self) -> Self::Instant {
        Instant::now()
    }

    fn wall_clock(&self) -> Timestamp {
        let elapsed = Instant::now().saturating_duration_since(self.inner.origin);
        let skew = Duration::from_millis(self.inner.skew_ms.load(Ordering::SeqCst));
        self.inner.epoch.saturating_add(elapsed).saturating_add(skew)
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.inner.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }
}
