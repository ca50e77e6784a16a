//! Deterministic test harness for the roomcast server.
//!
//! Tests run on tokio's paused clock: sleeping advances virtual time
//! instantly once every task is idle, so timer-driven behavior (typing
//! timeouts, scheduled deliveries, sweeps) is exercised without real waits.
//!
//! - [`SimEnv`]: `Environment` backed by the paused clock and a seeded RNG
//! - [`TestPeer`]: the client end of one connection's outbound queue

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod sim_env;
pub mod test_peer;

pub use sim_env::SimEnv;
pub use test_peer::TestPeer;
