//! Durable store capability
//!
//! The authoritative per-domain totals, bounce flags and cluster membership
//! live behind [`DurableStore`]. Two backends ship with the crate:
//!
//! - [`sqlite::SqliteStore`] - reference store shared by every node
//! - [`memory::MemoryStore`] - in-process store with fault injection, used by
//!   tests and single-node runs
//!
//! Every backend owns one store-wide [`Cooldown`] gate. The write-back cache
//! consults it before each flush attempt and arms it after a failed one.

pub mod memory;
pub mod sqlite;

use crate::model::{DomainEntry, HostEntry, QueryResponse};
use async_trait::async_trait;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Members not seen for this long are dropped by `update()`
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
pub enum StoreError {
    Unavailable(String),
    Database(String),
    Timeout,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(e) => write!(f, "Durable store unavailable: {}", e),
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::Timeout => write!(f, "Durable store call timed out"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Authoritative storage for flushed counters and cluster membership
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Upsert a flushed milestone
    ///
    /// Delivered totals are added to the existing row and bounce flags are
    /// OR-ed, so a bounced row never becomes un-bounced.
    async fn insert(&self, entry: &DomainEntry) -> Result<(), StoreError>;

    /// Read the durable record for `domain`
    ///
    /// An unknown domain is not an error: the zero-value
    /// [`QueryResponse`] is returned instead.
    async fn get(&self, domain: &str) -> Result<QueryResponse, StoreError>;

    /// Record that `member` is alive
    async fn ping(&self, member: &HostEntry) -> Result<(), StoreError>;

    /// Current live membership, with members older than the freshness
    /// window pruned
    async fn update(&self) -> Result<Vec<HostEntry>, StoreError>;

    /// True while the store-wide cooldown is armed
    fn is_delayed(&self) -> bool;

    /// Arm the cooldown for `duration` from now
    fn delay(&self, duration: Duration);
}

/// Store-wide flush gate armed after a failed write
///
/// Uses tokio's clock so paused-time tests can step over it.
#[derive(Debug, Default)]
pub struct Cooldown {
    until: RwLock<Option<Instant>>,
}

impl Cooldown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        let until = self.until.read().unwrap_or_else(PoisonError::into_inner);
        match *until {
            Some(deadline) => Instant::now() < deadline,
            None => false,
        }
    }

    pub fn arm(&self, duration: Duration) {
        let mut until = self.until.write().unwrap_or_else(PoisonError::into_inner);
        *until = Some(Instant::now() + duration);
    }
}
