//! Server configuration.
//!
//! Every knob has a production default; the binary overrides them from the
//! command line.

use std::{path::PathBuf, time::Duration};

use roomcast_core::presence::DEFAULT_TYPING_TIMEOUT;

/// Runtime configuration for [`Server`](crate::Server).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to (e.g., "0.0.0.0:8080")
    pub bind_address: String,
    /// Maximum concurrent connections; further handshakes are refused
    pub max_connections: usize,
    /// Events queued per connection before it counts as unreachable
    pub outbound_buffer: usize,
    /// Durable store location. In-memory store when `None`.
    pub database_path: Option<PathBuf>,
    /// `(token, user id)` pairs accepted by the static user directory
    pub tokens: Vec<(String, u64)>,
    /// Presence and typing settings
    pub presence: PresenceConfig,
    /// Scheduled delivery settings
    pub delivery: DeliveryConfig,
    /// Statistics fan-out settings
    pub statistics: StatisticsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
            outbound_buffer: 256,
            database_path: None,
            tokens: Vec::new(),
            presence: PresenceConfig::default(),
            delivery: DeliveryConfig::default(),
            statistics: StatisticsConfig::default(),
        }
    }
}

/// Presence tracker settings.
#[derive(Debug, Clone, Copy)]
pub struct PresenceConfig {
    /// How long a typing indicator lives without a refresh
    pub typing_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self { typing_timeout: DEFAULT_TYPING_TIMEOUT }
    }
}

/// Scheduled delivery engine settings.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryConfig {
    /// Period of the overdue recovery sweep
    pub sweep_interval: Duration,
    /// How long terminal records are kept
    pub retention: Duration,
    /// Period of the retention cleanup
    pub cleanup_interval: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Statistics loop settings.
#[derive(Debug, Clone, Copy)]
pub struct StatisticsConfig {
    /// Recompute period
    pub interval: Duration,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(30) }
    }
}
