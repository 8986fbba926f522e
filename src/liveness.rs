//! Liveness loop
//!
//! Runs for the lifetime of the node: announce this host to the durable
//! store, then refresh the aggregating reader's host snapshot. The first
//! round runs immediately, later rounds on a fixed interval. Failures are
//! logged and retried on the next round.

use crate::aggregator::AggregatingReader;
use crate::model::HostEntry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Default cadence between liveness rounds
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(60);

/// One ping + refresh round
pub async fn liveness_round(reader: &AggregatingReader, this_host: &str) {
    if let Err(e) = reader.ping(&HostEntry::now(this_host)).await {
        log::warn!("Error announcing {} as alive: {}", this_host, e);
    }
    if let Err(e) = reader.update().await {
        log::warn!("Error updating host list: {}", e);
    }
}

/// Liveness task - runs until `shutdown` is cancelled
pub async fn liveness_task(
    reader: Arc<AggregatingReader>,
    this_host: String,
    every: Duration,
    shutdown: CancellationToken,
) {
    log::info!("⏰ Starting liveness loop for {} (interval: {}s)", this_host, every.as_secs());

    let mut timer = interval(every);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = timer.tick() => {
                liveness_round(&reader, &this_host).await;
            }
        }
    }

    log::info!("Liveness loop stopped");
}
