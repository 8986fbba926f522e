//! Write-back counter cache
//!
//! Per-node ingestion path. Each domain has a [`CounterState`] that is bumped
//! on every event and handed over to the durable store ("flushed") when:
//!
//! - a bounce is seen (`PendingBounce`), or
//! - the delivered count reaches the catch-all threshold
//!
//! Flush policy:
//!
//! | outcome          | new state                                   |
//! |------------------|---------------------------------------------|
//! | bounce flushed   | `Bounced` (terminal, later events dropped)  |
//! | count flushed    | count minus the flushed total (normally 0)  |
//! | insert failed    | unchanged, store-wide cooldown armed        |
//! | store cooling    | unchanged, no I/O                           |
//!
//! A failed flush is retried lazily by the next event for that domain once
//! the cooldown has expired. There is no background retry.
//!
//! Locking: one process-wide `RwLock` over the map. It is never held across
//! the store call; a per-domain `flushing` marker keeps a second event from
//! starting a concurrent flush for the same domain.

use crate::model::{CounterState, DomainEntry};
use crate::persistence::{self, PersistenceError};
use crate::store::{DurableStore, StoreError};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Default `CatchAllThreshold`
pub const DEFAULT_THRESHOLD: u64 = 1000;

/// Default `RetryInsertTime`
pub const DEFAULT_RETRY_INSERT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Delivered events before a domain is flushed
    pub threshold: u64,
    /// Cooldown armed after a failed flush
    pub retry_after: Duration,
    /// Upper bound on a single store call
    pub store_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            retry_after: DEFAULT_RETRY_INSERT,
            store_timeout: Duration::from_secs(5),
        }
    }
}

/// What `send` did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Domain already bounced durably, event ignored
    Dropped,
    /// Counter updated, no flush warranted
    Counted,
    /// Flush warranted but skipped (store cooling down or flush in flight)
    Deferred,
    /// Milestone written to the durable store
    Flushed,
    /// Store rejected the flush; cooldown armed
    FlushFailed,
}

#[derive(Debug, Default, Clone, Copy)]
struct Slot {
    state: CounterState,
    flushing: bool,
}

pub struct WriteBackCache {
    slots: RwLock<HashMap<String, Slot>>,
    store: Arc<dyn DurableStore>,
    config: CacheConfig,
}

impl WriteBackCache {
    pub fn new(store: Arc<dyn DurableStore>, config: CacheConfig) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            store,
            config,
        }
    }

    pub fn threshold(&self) -> u64 {
        self.config.threshold
    }

    /// Record one delivered or bounced event
    ///
    /// Never fails from the caller's point of view: store trouble is
    /// absorbed by the cooldown and a later retry.
    pub async fn send(&self, entry: &DomainEntry) -> SendOutcome {
        if entry.domain.is_empty() {
            return SendOutcome::Dropped;
        }

        let record = {
            let mut slots = self.slots.write().await;
            let slot = slots.entry(entry.domain.clone()).or_default();

            let (next, carried) = match slot.state {
                CounterState::Bounced => return SendOutcome::Dropped,
                CounterState::PendingBounce => (CounterState::PendingBounce, 0),
                CounterState::Counting(n) if entry.is_bounce => (CounterState::PendingBounce, n),
                CounterState::Counting(n) => (CounterState::Counting(n + 1), n + 1),
            };
            slot.state = next;

            let warranted = match next {
                CounterState::PendingBounce => true,
                CounterState::Counting(n) => n >= self.config.threshold,
                CounterState::Bounced => false,
            };
            if !warranted {
                return SendOutcome::Counted;
            }
            if slot.flushing || self.store.is_delayed() {
                return SendOutcome::Deferred;
            }

            slot.flushing = true;
            DomainEntry {
                domain: entry.domain.clone(),
                is_bounce: next == CounterState::PendingBounce,
                count: carried,
            }
        };

        let result = match tokio::time::timeout(self.config.store_timeout, self.store.insert(&record)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        };

        let mut slots = self.slots.write().await;
        let slot = slots.entry(record.domain.clone()).or_default();
        slot.flushing = false;

        match result {
            Ok(()) => {
                log::debug!("Flushed {}", record);
                if record.is_bounce {
                    slot.state = CounterState::Bounced;
                } else if let CounterState::Counting(n) = slot.state {
                    // Events that raced the flush stay counted locally
                    slot.state = CounterState::Counting(n.saturating_sub(record.count));
                }
                SendOutcome::Flushed
            }
            Err(e) => {
                log::warn!(
                    "Error during durable insert of {}, delaying flushes {}s: {}",
                    record,
                    self.config.retry_after.as_secs(),
                    e
                );
                self.store.delay(self.config.retry_after);
                SendOutcome::FlushFailed
            }
        }
    }

    /// Wire value of the local counter: `n >= 0` while counting, `-1` once
    /// a bounce has been seen, `0` for an unknown domain
    pub async fn peek(&self, domain: &str) -> i64 {
        self.state(domain).await.wire_value()
    }

    pub async fn state(&self, domain: &str) -> CounterState {
        let slots = self.slots.read().await;
        slots.get(domain).map(|slot| slot.state).unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    /// Copy of every counter, sorted by domain
    pub async fn snapshot(&self) -> Vec<(String, CounterState)> {
        let mut rows: Vec<_> = {
            let slots = self.slots.read().await;
            slots.iter().map(|(domain, slot)| (domain.clone(), slot.state)).collect()
        };
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// Write the whole cache to the warm-start file
    pub async fn persist(&self, path: impl AsRef<Path>) -> Result<usize, PersistenceError> {
        let rows = self.snapshot().await;
        persistence::save_counters(&rows, path)
    }

    /// Merge the warm-start file into the cache, file rows winning
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<usize, PersistenceError> {
        let rows = persistence::load_counters(path)?;
        let count = rows.len();

        let mut slots = self.slots.write().await;
        for (domain, state) in rows {
            slots.insert(domain, Slot { state, flushing: false });
        }
        Ok(count)
    }
}
