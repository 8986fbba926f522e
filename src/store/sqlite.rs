//! SQLite durable store
//!
//! Schema (created on open, idempotent):
//!
//! ```sql
//! domains (domain TEXT PRIMARY KEY, delivered INTEGER, bounced INTEGER, updated_at INTEGER)
//! hosts   (host TEXT PRIMARY KEY, last_seen INTEGER)
//! ```
//!
//! Every node of a cluster opens the same database file. WAL mode keeps
//! readers from blocking the flush path.
//!
//! Statements run on tokio's blocking pool, so a caller's timeout can give
//! up on a call that is stuck behind another node's write lock.

use super::{Cooldown, DurableStore, StoreError, FRESHNESS_WINDOW};
use crate::model::{DomainEntry, HostEntry, QueryResponse};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS domains (
    domain      TEXT PRIMARY KEY,
    delivered   INTEGER NOT NULL DEFAULT 0,
    bounced     INTEGER NOT NULL DEFAULT 0,
    updated_at  INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS hosts (
    host        TEXT PRIMARY KEY,
    last_seen   INTEGER NOT NULL
);
"#;

/// How long a statement waits on another connection's lock by default
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    cooldown: Cooldown,
    freshness_window: Duration,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and apply the schema
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_busy_timeout(db_path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Like [`SqliteStore::open`], waiting at most `busy_timeout` on locks
    /// held by other connections
    ///
    /// Nodes pass their store call timeout here so an abandoned statement
    /// does not keep the connection busy much longer than its caller waited.
    pub fn open_with_busy_timeout(
        db_path: impl AsRef<Path>,
        busy_timeout: Duration,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(db_path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(SCHEMA)?;

        log::info!("✅ SQLite durable store ready: {}", db_path.as_ref().display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            cooldown: Cooldown::new(),
            freshness_window: FRESHNESS_WINDOW,
        })
    }

    /// Override the membership freshness window (tests)
    pub fn with_freshness_window(mut self, window: Duration) -> Self {
        self.freshness_window = window;
        self
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_connection<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("SQLite task failed: {}", e)))?
    }
}

fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn insert(&self, entry: &DomainEntry) -> Result<(), StoreError> {
        log::debug!("Inserting into durable store {}", entry);
        let entry = entry.clone();
        self.with_connection(move |conn| {
            conn.execute(
                r#"
                INSERT INTO domains (domain, delivered, bounced, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(domain) DO UPDATE SET
                    delivered = domains.delivered + excluded.delivered,
                    bounced = MAX(domains.bounced, excluded.bounced),
                    updated_at = excluded.updated_at
                "#,
                params![
                    entry.domain,
                    to_sql_count(entry.count),
                    entry.is_bounce,
                    Utc::now().timestamp(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, domain: &str) -> Result<QueryResponse, StoreError> {
        let domain = domain.to_string();
        self.with_connection(move |conn| {
            let row = conn
                .query_row(
                    "SELECT delivered, bounced FROM domains WHERE domain = ?1",
                    params![domain],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, bool>(1)?)),
                )
                .optional()?;

            Ok(match row {
                Some((delivered, bounced)) => QueryResponse {
                    domain,
                    bounced,
                    total: u64::try_from(delivered).unwrap_or(0),
                },
                None => QueryResponse::default(),
            })
        })
        .await
    }

    async fn ping(&self, member: &HostEntry) -> Result<(), StoreError> {
        let host = member.host.clone();
        let last_seen = member.last_seen.timestamp();
        self.with_connection(move |conn| {
            conn.execute(
                r#"
                INSERT INTO hosts (host, last_seen) VALUES (?1, ?2)
                ON CONFLICT(host) DO UPDATE SET last_seen = excluded.last_seen
                "#,
                params![host, last_seen],
            )?;
            Ok(())
        })
        .await
    }

    async fn update(&self) -> Result<Vec<HostEntry>, StoreError> {
        let window = chrono::Duration::from_std(self.freshness_window)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let cutoff = (Utc::now() - window).timestamp();

        let members = self
            .with_connection(move |conn| {
                let pruned = conn.execute("DELETE FROM hosts WHERE last_seen < ?1", params![cutoff])?;
                if pruned > 0 {
                    log::info!("Pruned {} stale hosts from membership", pruned);
                }

                let mut stmt = conn.prepare("SELECT host, last_seen FROM hosts ORDER BY host")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;

                let mut members = Vec::new();
                for row in rows {
                    let (host, seen) = row?;
                    let last_seen = Utc.timestamp_opt(seen, 0).single().unwrap_or_else(Utc::now);
                    members.push(HostEntry { host, last_seen });
                }
                Ok(members)
            })
            .await?;

        if members.is_empty() {
            log::warn!("No hosts found in membership table");
        }
        Ok(members)
    }

    fn is_delayed(&self) -> bool {
        self.cooldown.is_active()
    }

    fn delay(&self, duration: Duration) {
        self.cooldown.arm(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("catchall.db")).unwrap();
        (dir, store)
    }

    fn flush(domain: &str, count: u64, bounced: bool) -> DomainEntry {
        DomainEntry { domain: domain.to_string(), is_bounce: bounced, count }
    }

    #[tokio::test]
    async fn test_get_unknown_domain_is_zero_value() {
        let (_dir, store) = open_temp();
        let result = store.get("nowhere.io").await.unwrap();
        assert_eq!(result, QueryResponse::default());
        assert!(result.is_not_found());
    }

    #[tokio::test]
    async fn test_insert_adds_delivered_totals() {
        let (_dir, store) = open_temp();
        store.insert(&flush("a.com", 1000, false)).await.unwrap();
        store.insert(&flush("a.com", 1000, false)).await.unwrap();

        let result = store.get("a.com").await.unwrap();
        assert_eq!(result.domain, "a.com");
        assert_eq!(result.total, 2000);
        assert!(!result.bounced);
    }

    #[tokio::test]
    async fn test_bounce_flag_is_sticky() {
        let (_dir, store) = open_temp();
        store.insert(&flush("b.com", 5, true)).await.unwrap();
        store.insert(&flush("b.com", 1000, false)).await.unwrap();

        let result = store.get("b.com").await.unwrap();
        assert!(result.bounced);
    }

    #[tokio::test]
    async fn test_update_prunes_stale_members() {
        let (dir, store) = open_temp();
        store.ping(&HostEntry::now("10.0.0.2:8080")).await.unwrap();
        store.ping(&HostEntry::now("10.0.0.1:8080")).await.unwrap();
        store
            .ping(&HostEntry {
                host: "10.0.0.9:8080".to_string(),
                last_seen: Utc::now() - chrono::Duration::minutes(11),
            })
            .await
            .unwrap();

        let members = store.update().await.unwrap();
        let hosts: Vec<_> = members.iter().map(|m| m.host.as_str()).collect();
        assert_eq!(hosts, vec!["10.0.0.1:8080", "10.0.0.2:8080"]);

        // Pruned rows are gone for good
        let conn = Connection::open(dir.path().join("catchall.db")).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM hosts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_ping_refreshes_last_seen() {
        let (_dir, store) = open_temp();
        store
            .ping(&HostEntry {
                host: "node-a:8080".to_string(),
                last_seen: Utc::now() - chrono::Duration::minutes(30),
            })
            .await
            .unwrap();
        store.ping(&HostEntry::now("node-a:8080")).await.unwrap();

        let members = store.update().await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].host, "node-a:8080");
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catchall.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert(&flush("c.com", 3, false)).await.unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.get("c.com").await.unwrap().total, 3);
    }

    #[tokio::test]
    async fn test_locked_database_does_not_outlive_call_timeout() {
        use crate::cache::{CacheConfig, SendOutcome, WriteBackCache};
        use std::time::Instant;

        let (dir, store) = open_temp();
        let store = Arc::new(store);

        // Another node holds the write lock
        let other = Connection::open(dir.path().join("catchall.db")).unwrap();
        other.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let cache = WriteBackCache::new(
            store.clone(),
            CacheConfig {
                threshold: 1,
                retry_after: Duration::from_secs(60),
                store_timeout: Duration::from_millis(100),
            },
        );

        let started = Instant::now();
        let outcome = cache.send(&DomainEntry::delivered("a.com")).await;
        assert_eq!(outcome, SendOutcome::FlushFailed);
        assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
        assert!(store.is_delayed());

        other.execute_batch("ROLLBACK").unwrap();
        drop(other);
    }

    #[tokio::test]
    async fn test_short_busy_timeout_reports_locked_database() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catchall.db");
        let store = SqliteStore::open_with_busy_timeout(&path, Duration::from_millis(50)).unwrap();

        let other = Connection::open(&path).unwrap();
        other.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let err = store.insert(&flush("b.com", 1, false)).await.unwrap_err();
        assert!(matches!(err, StoreError::Database(_)), "got {}", err);

        other.execute_batch("ROLLBACK").unwrap();
        store.insert(&flush("b.com", 1, false)).await.unwrap();
        assert_eq!(store.get("b.com").await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_cooldown_gate() {
        let (_dir, store) = open_temp();
        assert!(!store.is_delayed());
        store.delay(Duration::from_secs(60));
        assert!(store.is_delayed());
    }
}
