//! In-memory durable store
//!
//! Same merge semantics as the SQLite store, plus fault injection knobs and
//! an insert log so tests can assert exactly what was flushed.

use super::{Cooldown, DurableStore, StoreError, FRESHNESS_WINDOW};
use crate::model::{DomainEntry, HostEntry, QueryResponse};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Default, Clone, Copy)]
struct Row {
    delivered: u64,
    bounced: bool,
}

pub struct MemoryStore {
    rows: Mutex<HashMap<String, Row>>,
    hosts: Mutex<HashMap<String, DateTime<Utc>>>,
    inserts: Mutex<Vec<DomainEntry>>,
    cooldown: Cooldown,
    freshness_window: Duration,

    fail_next_inserts: AtomicUsize,
    fail_get: AtomicBool,
    fail_ping: AtomicBool,
    fail_update: AtomicBool,
    get_calls: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            hosts: Mutex::new(HashMap::new()),
            inserts: Mutex::new(Vec::new()),
            cooldown: Cooldown::new(),
            freshness_window: FRESHNESS_WINDOW,
            fail_next_inserts: AtomicUsize::new(0),
            fail_get: AtomicBool::new(false),
            fail_ping: AtomicBool::new(false),
            fail_update: AtomicBool::new(false),
            get_calls: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` inserts fail with `StoreError::Unavailable`
    pub fn fail_next_inserts(&self, count: usize) {
        self.fail_next_inserts.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_get(&self, fail: bool) {
        self.fail_get.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_ping(&self, fail: bool) {
        self.fail_ping.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_update(&self, fail: bool) {
        self.fail_update.store(fail, Ordering::SeqCst);
    }

    /// Seed a durable row directly, bypassing the insert log
    pub fn seed(&self, domain: &str, delivered: u64, bounced: bool) {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        rows.insert(domain.to_string(), Row { delivered, bounced });
    }

    /// Seed a member with an explicit last-seen time
    pub fn seed_host(&self, host: &str, last_seen: DateTime<Utc>) {
        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        hosts.insert(host.to_string(), last_seen);
    }

    /// Every successful insert, in order
    pub fn inserts(&self) -> Vec<DomainEntry> {
        self.inserts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    fn take_insert_failure(&self) -> bool {
        self.fail_next_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn insert(&self, entry: &DomainEntry) -> Result<(), StoreError> {
        if self.take_insert_failure() {
            return Err(StoreError::Unavailable("simulated insert failure".to_string()));
        }

        {
            let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
            let row = rows.entry(entry.domain.clone()).or_default();
            row.delivered = row.delivered.saturating_add(entry.count);
            row.bounced |= entry.is_bounce;
        }
        self.inserts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        Ok(())
    }

    async fn get(&self, domain: &str) -> Result<QueryResponse, StoreError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated get failure".to_string()));
        }

        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(match rows.get(domain) {
            Some(row) => QueryResponse {
                domain: domain.to_string(),
                bounced: row.bounced,
                total: row.delivered,
            },
            None => QueryResponse::default(),
        })
    }

    async fn ping(&self, member: &HostEntry) -> Result<(), StoreError> {
        if self.fail_ping.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated ping failure".to_string()));
        }
        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        hosts.insert(member.host.clone(), member.last_seen);
        Ok(())
    }

    async fn update(&self) -> Result<Vec<HostEntry>, StoreError> {
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated update failure".to_string()));
        }

        let window = chrono::Duration::from_std(self.freshness_window)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let cutoff = Utc::now() - window;

        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        hosts.retain(|_, seen| *seen >= cutoff);

        let mut members: Vec<HostEntry> = hosts
            .iter()
            .map(|(host, seen)| HostEntry { host: host.clone(), last_seen: *seen })
            .collect();
        members.sort_by(|a, b| a.host.cmp(&b.host));
        Ok(members)
    }

    fn is_delayed(&self) -> bool {
        self.cooldown.is_active()
    }

    fn delay(&self, duration: Duration) {
        self.cooldown.arm(duration);
    }
}
