//! Event simulator - replays synthetic delivered/bounced events against a node
//!
//! Usage:
//!   cargo run --release --bin event_sim
//!
//! Environment variables:
//!   SIM_TARGET      - node base URL (default: http://127.0.0.1:8080)
//!   SIM_DOMAINS     - number of domains to generate (default: 100)
//!   SIM_CONCURRENCY - domains replayed in parallel (default: 20)

use catchall::simulator::{generate_burst, DomainBurst};
use dotenv::dotenv;
use log::{info, warn};
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

fn env_or<T: std::str::FromStr>(var: &str, default: T) -> T {
    env::var(var).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

async fn replay(client: &reqwest::Client, target: &str, burst: DomainBurst, failed: &AtomicU64) -> u64 {
    let mut sent = 0;
    for event in burst.events {
        let action = if event.is_bounce { "bounced" } else { "delivered" };
        let url = format!("{}/events/{}/{}", target, event.domain, action);
        match client.put(&url).send().await {
            Ok(resp) if resp.status().is_success() => sent += 1,
            Ok(resp) => {
                warn!("⚠️  {} answered {}", url, resp.status());
                failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("⚠️  {} failed: {}", url, e);
                failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    sent
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let target = env::var("SIM_TARGET").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());
    let domains: usize = env_or("SIM_DOMAINS", 100);
    let concurrency: usize = env_or("SIM_CONCURRENCY", 20).max(1);

    info!("🚀 Simulating {} domains against {} ({} in parallel)", domains, target, concurrency);

    let bursts: Vec<DomainBurst> = {
        let mut rng = rand::thread_rng();
        (0..domains).map(|i| generate_burst(&mut rng, i)).collect()
    };
    let catch_all = bursts.iter().filter(|b| b.bounces() == 0).count();
    info!("   └─ {} domains generated without bounces", catch_all);

    let client = reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;
    let limiter = Arc::new(Semaphore::new(concurrency));
    let failed = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    let mut handles = Vec::with_capacity(bursts.len());
    for burst in bursts {
        let permit = limiter.clone().acquire_owned().await?;
        let client = client.clone();
        let target = target.clone();
        let failed = failed.clone();
        handles.push(tokio::spawn(async move {
            let sent = replay(&client, &target, burst, &failed).await;
            drop(permit);
            sent
        }));
    }

    let mut sent = 0u64;
    for handle in handles {
        sent += handle.await.unwrap_or(0);
    }

    let elapsed = started.elapsed().as_secs_f64();
    info!(
        "✅ Sent {} events ({} failed) in {:.1}s - {:.1} events/sec",
        sent,
        failed.load(Ordering::Relaxed),
        elapsed,
        sent as f64 / elapsed.max(f64::EPSILON)
    );
    Ok(())
}
