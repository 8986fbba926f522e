//! Aggregating reader
//!
//! Per-node query path. Answers "how many deliveries has the cluster seen
//! for this domain, and has anyone seen a bounce?" by combining:
//!
//! 1. the durable record (flushed milestones from every node), and
//! 2. each peer's live, unflushed counter, fetched at read time
//!
//! The peer list is a local snapshot refreshed by the liveness loop. The
//! snapshot lock is held only to copy the list, never across the fan-out.
//! Results are approximate: each read is an independent point-in-time call.

use crate::model::{DomainEntry, HostEntry, QueryResponse};
use crate::peer::PeerQuery;
use crate::store::{DurableStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug)]
pub enum ReaderError {
    /// The initial snapshot must contain at least this node
    NoHosts,
}

impl std::fmt::Display for ReaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReaderError::NoHosts => write!(f, "Aggregating reader requires at least one host (itself)"),
        }
    }
}

impl std::error::Error for ReaderError {}

pub struct AggregatingReader {
    hosts: RwLock<Vec<String>>,
    store: Arc<dyn DurableStore>,
    peers: Arc<dyn PeerQuery>,
    store_timeout: Duration,
}

impl AggregatingReader {
    pub fn new(
        hosts: Vec<String>,
        store: Arc<dyn DurableStore>,
        peers: Arc<dyn PeerQuery>,
        store_timeout: Duration,
    ) -> Result<Self, ReaderError> {
        if hosts.is_empty() {
            return Err(ReaderError::NoHosts);
        }
        Ok(Self {
            hosts: RwLock::new(hosts),
            store,
            peers,
            store_timeout,
        })
    }

    /// Copy of the current host snapshot
    pub async fn hosts(&self) -> Vec<String> {
        self.hosts.read().await.clone()
    }

    async fn replace_hosts(&self, hosts: Vec<String>) {
        *self.hosts.write().await = hosts;
    }

    /// Cluster-wide view of `domain`
    ///
    /// Infallible: a store error counts as "no durable record" and a failing
    /// peer is skipped.
    pub async fn get(&self, domain: &str) -> QueryResponse {
        if domain.is_empty() {
            return QueryResponse::default();
        }

        let durable = match tokio::time::timeout(self.store_timeout, self.store.get(domain)).await {
            Ok(Ok(record)) => record,
            Ok(Err(e)) => {
                log::warn!("Error reading {} from durable store: {}", domain, e);
                QueryResponse::default()
            }
            Err(_) => {
                log::warn!("Error reading {} from durable store: {}", domain, StoreError::Timeout);
                QueryResponse::default()
            }
        };

        if durable.bounced {
            return QueryResponse::bounced(domain);
        }

        let mut total = durable.total;
        for host in self.hosts().await {
            if host.is_empty() {
                continue;
            }
            match self.peers.stats(&host, domain).await {
                Ok(peer_total) if peer_total < 0 => {
                    log::debug!("Peer {} holds an unflushed bounce for {}", host, domain);
                    return QueryResponse::bounced(domain);
                }
                Ok(peer_total) => {
                    total = total.saturating_add(peer_total as u64);
                }
                Err(e) => {
                    log::warn!("Failed stats query to {} for {}: {}", host, domain, e);
                }
            }
        }

        QueryResponse {
            domain: domain.to_string(),
            bounced: false,
            total,
        }
    }

    /// Announce `member` as alive
    pub async fn ping(&self, member: &HostEntry) -> Result<(), StoreError> {
        match tokio::time::timeout(self.store_timeout, self.store.ping(member)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        }
    }

    /// Refresh the host snapshot from the store's live membership
    ///
    /// The snapshot is replaced wholesale, never merged. On error the
    /// previous snapshot is kept.
    pub async fn update(&self) -> Result<Vec<HostEntry>, StoreError> {
        let members = match tokio::time::timeout(self.store_timeout, self.store.update()).await {
            Ok(result) => result?,
            Err(_) => return Err(StoreError::Timeout),
        };

        let hosts = members.iter().map(|m| m.host.clone()).collect();
        self.replace_hosts(hosts).await;
        log::debug!("Host snapshot refreshed: {} live members", members.len());
        Ok(members)
    }

    /// Durable writes go through each node's write-back cache, never here
    pub async fn insert(&self, _entry: &DomainEntry) -> Result<(), StoreError> {
        Ok(())
    }
}
