//! Timekeep Server
//!
//! Run with: cargo run
//!
//! Environment variables:
//! - TIMEKEEP_HOST: Bind address (default: 0.0.0.0)
//! - TIMEKEEP_PORT: Port number (default: 5600)
//! - TIMEKEEP_HOSTNAME: Hostname reported to clients (default: $HOSTNAME, then localhost)
//! - TIMEKEEP_DATA_DIR: Snapshot directory (default: unset, in-memory only)
//! - TIMEKEEP_SNAPSHOT_INTERVAL_SECS: Seconds between snapshots (default: 300)
//! - TIMEKEEP_QUERY_THREADS: Threads for query evaluation (default: number of CPUs)
//! - TIMEKEEP_DEFAULT_PULSETIME: Heartbeat pulse window in seconds (default: 60)
//! - RUST_LOG: Log filter (default: timekeep=info,tower_http=info)

use timekeep::api::{run_server, ServerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "timekeep=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env();

    // Query periods are evaluated on the global rayon pool
    if let Err(e) = rayon::ThreadPoolBuilder::new()
        .num_threads(config.query_threads)
        .thread_name(|i| format!("timekeep-query-{}", i))
        .build_global()
    {
        tracing::warn!("Could not configure query thread pool: {}", e);
    }

    tracing::info!("Timekeep configuration:");
    tracing::info!("  Host: {}:{}", config.host, config.port);
    tracing::info!("  Hostname: {}", config.hostname);
    match &config.data_dir {
        Some(dir) => {
            tracing::info!("  Data directory: {}", dir.display());
            tracing::info!(
                "  Snapshot interval: {} seconds",
                config.snapshot_interval_secs
            );
        }
        None => tracing::info!("  Data directory: none (in-memory only)"),
    }
    tracing::info!("  Query threads: {}", config.query_threads);
    tracing::info!(
        "  Default pulsetime: {} seconds",
        config.default_pulsetime
    );

    println!(
        r#"
  _____ _                _
 |_   _(_)_ __ ___   ___| | _____  ___ _ __
   | | | | '_ ` _ \ / _ \ |/ / _ \/ _ \ '_ \
   | | | | | | | | |  __/   <  __/  __/ |_) |
   |_| |_|_| |_| |_|\___|_|\_\___|\___| .__/
                                      |_|
 Activity Tracking Server
 Version: {}
"#,
        env!("CARGO_PKG_VERSION")
    );

    run_server(config).await
}
