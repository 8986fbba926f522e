//! Domain counter state and the records exchanged between components
//!
//! `CounterState` is the per-domain in-memory state of the write-back cache.
//! Two integer encodings exist for it:
//!
//! - **wire** (`/stats/{domain}` payload, read by peers): non-negative means
//!   `Counting(n)`, any bounce collapses to `-1`
//! - **file** (warm-start rows): `-1` is `Bounced`, `-2` is `PendingBounce`,
//!   so a reload restores the exact variant

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire sentinel for "this node has seen a bounce for the domain"
pub const WIRE_BOUNCED: i64 = -1;

/// File code for a bounce already recorded in the durable store
pub const FILE_BOUNCED: i64 = -1;

/// File code for a bounce not yet recorded in the durable store
pub const FILE_PENDING_BOUNCE: i64 = -2;

/// Per-domain state held by the write-back cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterState {
    /// Delivered events seen locally since the last successful flush
    Counting(u64),
    /// A bounce was observed but has not reached the durable store yet
    PendingBounce,
    /// The bounce is durable; every later event for the domain is dropped
    Bounced,
}

impl Default for CounterState {
    fn default() -> Self {
        CounterState::Counting(0)
    }
}

impl CounterState {
    /// Integer served to peers and to the stats endpoint
    pub fn wire_value(&self) -> i64 {
        match self {
            CounterState::Counting(n) => i64::try_from(*n).unwrap_or(i64::MAX),
            CounterState::PendingBounce | CounterState::Bounced => WIRE_BOUNCED,
        }
    }

    /// Integer written to the warm-start file
    pub fn file_value(&self) -> i64 {
        match self {
            CounterState::Counting(n) => i64::try_from(*n).unwrap_or(i64::MAX),
            CounterState::PendingBounce => FILE_PENDING_BOUNCE,
            CounterState::Bounced => FILE_BOUNCED,
        }
    }

    /// Inverse of [`CounterState::file_value`]; unknown negative codes are rejected
    pub fn from_file_value(value: i64) -> Option<Self> {
        match value {
            FILE_BOUNCED => Some(CounterState::Bounced),
            FILE_PENDING_BOUNCE => Some(CounterState::PendingBounce),
            n if n >= 0 => Some(CounterState::Counting(n as u64)),
            _ => None,
        }
    }
}

/// A single ingestion event, and the record flushed to the durable store
///
/// On ingestion `count` is unused (0). On flush it carries the delivered
/// total being handed over to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEntry {
    pub domain: String,
    #[serde(rename = "bounced")]
    pub is_bounce: bool,
    #[serde(rename = "c")]
    pub count: u64,
}

impl DomainEntry {
    pub fn delivered(domain: impl Into<String>) -> Self {
        Self { domain: domain.into(), is_bounce: false, count: 0 }
    }

    pub fn bounced(domain: impl Into<String>) -> Self {
        Self { domain: domain.into(), is_bounce: true, count: 0 }
    }
}

impl fmt::Display for DomainEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_bounce { "B" } else { "D" };
        write!(f, "{}:{}:{}", kind, self.domain, self.count)
    }
}

/// Cluster member liveness row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    pub host: String,
    #[serde(rename = "lastseen")]
    pub last_seen: DateTime<Utc>,
}

impl HostEntry {
    /// Entry stamped with the current time
    pub fn now(host: impl Into<String>) -> Self {
        Self { host: host.into(), last_seen: Utc::now() }
    }
}

impl fmt::Display for HostEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.last_seen.to_rfc3339())
    }
}

/// Payload of `GET /stats/{domain}` (the inter-node protocol)
///
/// A negative `total` means the answering node holds an unflushed bounce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsQuery {
    pub domain: String,
    pub total: i64,
}

impl fmt::Display for StatsQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.domain, self.total)
    }
}

/// Durable record as read back from the store, and the aggregate query result
///
/// The zero value (empty domain) is the "not found" sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub domain: String,
    pub bounced: bool,
    pub total: u64,
}

impl QueryResponse {
    pub fn bounced(domain: impl Into<String>) -> Self {
        Self { domain: domain.into(), bounced: true, total: 0 }
    }

    pub fn is_not_found(&self) -> bool {
        self.domain.is_empty()
    }

    /// Nothing is known about the domain anywhere in the cluster
    pub fn is_unseen(&self) -> bool {
        self.is_not_found() || (!self.bounced && self.total == 0)
    }
}

impl fmt::Display for QueryResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.domain, self.bounced, self.total)
    }
}

/// Classification served by `GET /domains/{domain}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassificationStatus {
    #[serde(rename = "not catch-all")]
    NotCatchAll,
    #[serde(rename = "catch-all")]
    CatchAll,
    #[serde(rename = "unknown")]
    Unknown,
}

impl ClassificationStatus {
    /// Bounce dominates; otherwise the total must reach the threshold
    pub fn classify(result: &QueryResponse, threshold: u64) -> Self {
        if result.bounced {
            ClassificationStatus::NotCatchAll
        } else if result.total >= threshold {
            ClassificationStatus::CatchAll
        } else {
            ClassificationStatus::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationStatus::NotCatchAll => "not catch-all",
            ClassificationStatus::CatchAll => "catch-all",
            ClassificationStatus::Unknown => "unknown",
        }
    }
}

/// Response body of `GET /domains/{domain}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainStatus {
    pub domain: String,
    pub status: ClassificationStatus,
}

impl fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.domain, self.status.as_str())
    }
}
