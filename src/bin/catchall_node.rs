//! Catch-all node runtime
//!
//! This binary runs one cluster node:
//! - Opens the shared SQLite durable store
//! - Restores the write-back cache from the warm-start file
//! - Spawns the liveness loop (and the optional autosave task)
//! - Serves ingestion, stats and query routes until SIGINT/SIGTERM
//! - Drains everything, then rewrites the warm-start file
//!
//! Usage:
//!   cargo run --release --bin catchall_node
//!
//! Environment variables: see `NodeConfig::from_env`.

use catchall::{
    api::{self, AppState},
    liveness::liveness_task,
    persistence::persistence_task,
    AggregatingReader, DurableStore, HttpPeerQuery, NodeConfig, SqliteStore, WriteBackCache,
};
use dotenv::dotenv;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    info!("🚀 Starting catch-all node");

    let config = NodeConfig::from_env()?;
    info!("📊 Configuration:");
    info!("   ├─ Node address: {}", config.node_address());
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Threshold: {} delivered events", config.threshold);
    info!("   ├─ Retry insert after: {}s", config.retry_insert.as_secs());
    info!("   ├─ Liveness interval: {}s", config.liveness_interval.as_secs());
    info!("   ├─ Peer timeout: {}ms", config.peer_timeout.as_millis());
    info!("   ├─ Warm-start file: {}", config.warm_start_path.display());
    info!("   └─ Seed hosts: {:?}", config.seed_hosts);

    let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::open_with_busy_timeout(
        &config.db_path,
        config.store_timeout,
    )?);

    let cache = Arc::new(WriteBackCache::new(store.clone(), config.cache_config()));
    match cache.load(&config.warm_start_path).await {
        Ok(count) => info!("✅ Cache initialized ({} counters restored)", count),
        Err(e) => warn!("⚠️  Error initializing cache from warm-start file: {}", e),
    }

    let peers = Arc::new(HttpPeerQuery::new(config.peer_timeout)?);
    let reader = Arc::new(AggregatingReader::new(
        config.initial_hosts(),
        store.clone(),
        peers,
        config.store_timeout,
    )?);

    let shutdown = CancellationToken::new();

    let liveness_handle = tokio::spawn(liveness_task(
        reader.clone(),
        config.node_address(),
        config.liveness_interval,
        shutdown.clone(),
    ));

    let autosave_handle = tokio::spawn(persistence_task(
        cache.clone(),
        config.persistence_config(),
        shutdown.clone(),
    ));

    let app = api::router(AppState { cache: cache.clone(), reader: reader.clone() });
    let listener = tokio::net::TcpListener::bind((config.bind_addr.as_str(), config.port)).await?;
    info!("🔌 Listening on {}", listener.local_addr()?);
    info!("🔄 Press CTRL+C to shutdown gracefully");

    let server_shutdown = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                () = shutdown_signal() => {},
                () = server_shutdown.cancelled() => {},
            }
        })
        .await;

    // Stop background tasks whether the server exited cleanly or not
    shutdown.cancel();
    if let Err(e) = served {
        error!("❌ HTTP server error: {}", e);
    }
    info!("HTTP server shut down");

    if let Err(e) = liveness_handle.await {
        error!("❌ Liveness task panicked: {}", e);
    }
    if let Err(e) = autosave_handle.await {
        error!("❌ Autosave task panicked: {}", e);
    }

    info!("Writing cache to {}", config.warm_start_path.display());
    match cache.persist(&config.warm_start_path).await {
        Ok(count) => info!("✅ Cache saved ({} counters)", count),
        Err(e) => error!("❌ Error persisting cache: {}", e),
    }

    info!("✅ Node stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("❌ Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!("❌ Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("⚠️  Shutdown signal received, draining requests...");
}
