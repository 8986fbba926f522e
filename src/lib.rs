//! # catchall
//!
//! Classifies mail domains as catch-all or not from a live stream of
//! per-domain delivered/bounced events, across a cluster of identical nodes.
//!
//! Each node keeps a write-back counter cache per domain and flushes to a
//! shared durable store once a domain reaches the threshold or bounces.
//! Queries combine the durable total with every live peer's unflushed
//! counter, skipping slow or dead peers.
//!
//! ## Module Organization
//!
//! - `model` - counter state and the records exchanged between components
//! - `store` - durable store capability (SQLite + in-memory backends)
//! - `peer` - inter-node stats query
//! - `cache` - write-back cache (ingestion path)
//! - `aggregator` - aggregating reader (query path)
//! - `liveness` - periodic membership announce/refresh
//! - `persistence` - warm-start file
//! - `api` - HTTP routes
//! - `config` - environment configuration
//! - `simulator` - synthetic event generator for load tests

pub mod aggregator;
pub mod api;
pub mod cache;
pub mod config;
pub mod liveness;
pub mod model;
pub mod peer;
pub mod persistence;
pub mod simulator;
pub mod store;

pub use aggregator::AggregatingReader;
pub use cache::{CacheConfig, SendOutcome, WriteBackCache};
pub use config::NodeConfig;
pub use model::{CounterState, DomainEntry, HostEntry, QueryResponse};
pub use peer::{HttpPeerQuery, PeerQuery};
pub use store::{DurableStore, MemoryStore, SqliteStore};
