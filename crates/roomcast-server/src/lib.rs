//! Roomcast production server.
//!
//! Real-time room messaging over WebSocket: connection registry, room
//! fan-out, presence and typing indicators, exactly-once scheduled delivery
//! and a periodic statistics broadcast.
//!
//! # Architecture
//!
//! The pure state machines live in [`roomcast_core`]. This crate executes
//! them against real I/O: tokio tasks for timers and background loops,
//! tokio-tungstenite for the socket, redb or memory for persistence.
//!
//! # Components
//!
//! - [`ConnectionRegistry`]: who is connected, who is in which room
//! - [`Broadcaster`]: non-blocking fan-out to rooms, pairs, everyone
//! - [`PresenceService`]: presence and typing, announced to rooms
//! - [`DeliveryEngine`]: scheduled messages, timers and recovery sweep
//! - [`StatisticsLoop`]: periodic snapshot broadcast
//! - [`Hub`]: per-signal dispatcher owning all of the above
//! - [`Server`]: production runtime binding [`Hub`] to [`WsTransport`]

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod broadcaster;
mod config;
mod directory;
mod error;
mod hub;
mod presence;
mod registry;
pub mod scheduler;
mod statistics;
pub mod storage;
mod system_env;
mod transport;

use std::sync::Arc;

pub use broadcaster::{BroadcastReport, Broadcaster};
pub use config::{DeliveryConfig, PresenceConfig, ServerConfig, StatisticsConfig};
pub use directory::{AuthError, StaticDirectory, UserDirectory, parse_token_pair};
pub use error::ServerError;
pub use hub::{HealthSnapshot, Hub};
pub use presence::PresenceService;
pub use registry::{
    ConnectionInfo, ConnectionRegistry, IdentityBinding, JoinOutcome, LeaveOutcome, Registration,
};
pub use scheduler::{DeliveryEngine, FireOutcome, SchedulerStatistics, SweepReport};
pub use statistics::{AggregateSource, MemoryAggregates, RegistryAggregates, StatisticsLoop};
pub use storage::{ChaoticStore, MemoryStore, MessageStore, RedbStore, StorageError};
pub use system_env::SystemEnv;
use roomcast_proto::UserId;
use tokio_util::sync::CancellationToken;
pub use transport::{WsTransport, serve_connection};

/// Production Roomcast server.
///
/// Wraps a [`Hub`] with the WebSocket transport and system environment.
pub struct Server<S: MessageStore> {
    hub: Arc<Hub<SystemEnv, S>>,
    transport: WsTransport,
    counters: MemoryAggregates,
    config: ServerConfig,
    shutdown: CancellationToken,
}

impl<S: MessageStore> Server<S> {
    /// Create and bind a new server over `store` with fresh session, task
    /// and achievement counters. Update them through [`counters`](Self::counters).
    pub async fn bind(config: ServerConfig, store: S) -> Result<Self, ServerError> {
        Self::bind_with_counters(config, store, MemoryAggregates::new()).await
    }

    /// Create and bind a new server whose statistics read `counters`.
    ///
    /// Active users always come from the connection registry; the other
    /// figures are whatever the caller records into `counters`.
    pub async fn bind_with_counters(
        config: ServerConfig,
        store: S,
        counters: MemoryAggregates,
    ) -> Result<Self, ServerError> {
        let env = SystemEnv::new();
        let directory: StaticDirectory =
            config.tokens.iter().map(|(token, user)| (token.clone(), UserId(*user))).collect();
        if directory.is_empty() {
            tracing::warn!("No tokens configured - every connection stays anonymous");
        }

        let registry = Arc::new(ConnectionRegistry::new());
        let aggregates = RegistryAggregates::new(Arc::clone(&registry), counters.clone());
        let hub = Hub::with_registry(
            env,
            store,
            registry,
            Arc::new(directory),
            Arc::new(aggregates),
            config.clone(),
        );

        let transport = WsTransport::bind(&config.bind_address).await?;

        Ok(Self {
            hub: Arc::new(hub),
            transport,
            counters,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    /// Session, task and achievement counters feeding the statistics
    /// broadcast.
    pub fn counters(&self) -> &MemoryAggregates {
        &self.counters
    }

    /// Token that stops the server and its background loops when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Shared dispatcher.
    pub fn hub(&self) -> &Arc<Hub<SystemEnv, S>> {
        &self.hub
    }

    /// Run the server, accepting connections until shut down.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!("Server starting on {}", self.transport.local_addr()?);

        let background = self.hub.spawn_background(&self.shutdown);

        loop {
            let accepted = tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = self.transport.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let hub = Arc::clone(&self.hub);
                    let shutdown = self.shutdown.clone();
                    let buffer = self.config.outbound_buffer;

                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(hub, stream, peer, buffer, shutdown).await {
                            tracing::warn!(%peer, "Connection error: {}", e);
                        }
                    });
                },
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                },
            }
        }

        tracing::info!("Server shutting down");
        for task in background {
            if let Err(e) = task.await {
                tracing::error!("Background task failed: {}", e);
            }
        }
        Ok(())
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        self.transport.local_addr()
    }
}
