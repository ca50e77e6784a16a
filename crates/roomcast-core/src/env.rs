//! Environment abstraction for deterministic testing.
//!
//! Decouples server logic from system resources (time, randomness). Tests run
//! against tokio's paused clock with a seeded RNG; production uses the real
//! clock and OS entropy.

use std::time::Duration;

use roomcast_proto::Timestamp;

/// Abstract environment providing time, randomness, and async sleeping.
///
/// # Invariants
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic instant type used by this environment.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current monotonic time.
    fn now(&self) -> Self::Instant;

    /// Current wall-clock time in unix milliseconds.
    ///
    /// Scheduled delivery times and persisted timestamps are compared against
    /// this clock. It may jump (NTP, simulated downtime), so it is never used
    /// to measure elapsed time.
    fn wall_clock(&self) -> Timestamp;

    /// Sleeps for the specified duration.
    ///
    /// Only driver code sleeps; state machines never do.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }
}
