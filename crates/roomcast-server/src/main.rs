//! Roomcast server binary.
//!
//! # Usage
//!
//! ```bash
//! # In-memory store, two known tokens
//! roomcast-server --bind 0.0.0.0:8080 --token alice-secret=1 --token bob-secret=2
//!
//! # Durable store
//! roomcast-server --database /var/lib/roomcast/roomcast.redb --token alice-secret=1
//! ```

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use roomcast_server::{
    DeliveryConfig, MemoryStore, MessageStore, PresenceConfig, RedbStore, Server, ServerConfig,
    StatisticsConfig, parse_token_pair,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Roomcast real-time messaging server
#[derive(Parser, Debug)]
#[command(name = "roomcast-server")]
#[command(about = "Room messaging server with presence and scheduled delivery")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    bind: String,

    /// Path to the redb database. In-memory store if omitted.
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Accepted credential as TOKEN=USER_ID (repeatable)
    #[arg(long = "token", value_parser = parse_token_pair)]
    tokens: Vec<(String, u64)>,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Events queued per connection before it is dropped as unreachable
    #[arg(long, default_value = "256")]
    outbound_buffer: usize,

    /// Seconds a typing indicator lives without a refresh
    #[arg(long, default_value = "6")]
    typing_timeout_secs: u64,

    /// Seconds between recovery sweeps of overdue deliveries
    #[arg(long, default_value = "30")]
    sweep_interval_secs: u64,

    /// Seconds between statistics broadcasts
    #[arg(long, default_value = "30")]
    statistics_interval_secs: u64,

    /// Days terminal delivery records are kept
    #[arg(long, default_value = "30")]
    retention_days: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn config(&self) -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            bind_address: self.bind.clone(),
            max_connections: self.max_connections,
            outbound_buffer: self.outbound_buffer,
            database_path: self.database.clone(),
            tokens: self.tokens.clone(),
            presence: PresenceConfig { typing_timeout: Duration::from_secs(self.typing_timeout_secs) },
            delivery: DeliveryConfig {
                sweep_interval: Duration::from_secs(self.sweep_interval_secs),
                retention: Duration::from_secs(self.retention_days * 24 * 60 * 60),
                ..defaults.delivery
            },
            statistics: StatisticsConfig {
                interval: Duration::from_secs(self.statistics_interval_secs),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Roomcast server starting");
    tracing::info!("Binding to {}", args.bind);

    let config = args.config();
    match &config.database_path {
        Some(path) => {
            tracing::info!("Opening database at {}", path.display());
            let store = RedbStore::open(path)?;
            serve(config, store).await
        },
        None => {
            tracing::warn!("No database configured - scheduled messages will not survive restarts");
            serve(config, MemoryStore::new()).await
        },
    }
}

async fn serve<S: MessageStore>(
    config: ServerConfig,
    store: S,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(config, store).await?;

    tracing::info!("Server listening on {}", server.local_addr()?);

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received");
        }
        shutdown.cancel();
    });

    server.run().await?;

    Ok(())
}
