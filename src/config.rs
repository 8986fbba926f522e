//! Node configuration from environment variables
//!
//! A `.env` file in the working directory is honoured by the binaries
//! (loaded with `dotenv` before `NodeConfig::from_env`).

use crate::cache::{CacheConfig, DEFAULT_RETRY_INSERT, DEFAULT_THRESHOLD};
use crate::liveness::DEFAULT_LIVENESS_INTERVAL;
use crate::persistence::PersistenceConfig;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Configuration for one cluster node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Host this node announces to its peers (without port)
    pub host: String,

    pub port: u16,

    /// Address the HTTP listener binds to
    pub bind_addr: String,

    /// SQLite durable store shared by the cluster
    pub db_path: String,

    /// Delivered events before a domain is flushed / called catch-all
    pub threshold: u64,

    pub retry_insert: Duration,

    pub liveness_interval: Duration,

    pub peer_timeout: Duration,

    pub store_timeout: Duration,

    pub warm_start_path: PathBuf,

    /// Zero means the warm-start file is only written at shutdown
    pub autosave_interval: Duration,

    /// Peers known before the first liveness round
    pub seed_hosts: Vec<String>,
}

fn parse_or<T: std::str::FromStr>(var: &str, default: T) -> T {
    match env::var(var) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Invalid {} '{}', using default", var, raw);
                default
            }
        },
        Err(_) => default,
    }
}

impl NodeConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `CATCHALL_HOST` (default: 127.0.0.1)
    /// - `CATCHALL_PORT` (default: 8080)
    /// - `CATCHALL_BIND_ADDR` (default: 0.0.0.0)
    /// - `CATCHALL_DB_PATH` (default: catchall.db)
    /// - `CATCHALL_THRESHOLD` (default: 1000)
    /// - `CATCHALL_RETRY_INSERT_SECS` (default: 60)
    /// - `CATCHALL_LIVENESS_INTERVAL_SECS` (default: 60)
    /// - `CATCHALL_PEER_TIMEOUT_MS` (default: 2000)
    /// - `CATCHALL_STORE_TIMEOUT_MS` (default: 5000)
    /// - `CATCHALL_WARM_START_PATH` (default: queue.csv)
    /// - `CATCHALL_AUTOSAVE_SECS` (default: 0, disabled)
    /// - `CATCHALL_SEED_HOSTS` (default: empty, comma-separated host:port list)
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            host: env::var("CATCHALL_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parse_or("CATCHALL_PORT", 8080),
            bind_addr: env::var("CATCHALL_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string()),
            db_path: env::var("CATCHALL_DB_PATH").unwrap_or_else(|_| "catchall.db".to_string()),
            threshold: parse_or("CATCHALL_THRESHOLD", DEFAULT_THRESHOLD),
            retry_insert: Duration::from_secs(parse_or(
                "CATCHALL_RETRY_INSERT_SECS",
                DEFAULT_RETRY_INSERT.as_secs(),
            )),
            liveness_interval: Duration::from_secs(parse_or(
                "CATCHALL_LIVENESS_INTERVAL_SECS",
                DEFAULT_LIVENESS_INTERVAL.as_secs(),
            )),
            peer_timeout: Duration::from_millis(parse_or("CATCHALL_PEER_TIMEOUT_MS", 2_000)),
            store_timeout: Duration::from_millis(parse_or("CATCHALL_STORE_TIMEOUT_MS", 5_000)),
            warm_start_path: env::var("CATCHALL_WARM_START_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("queue.csv")),
            autosave_interval: Duration::from_secs(parse_or("CATCHALL_AUTOSAVE_SECS", 0)),
            seed_hosts: env::var("CATCHALL_SEED_HOSTS")
                .map(|s| {
                    s.split(',')
                        .map(|host| host.trim().to_string())
                        .filter(|host| !host.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingVariable("CATCHALL_HOST".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidValue("CATCHALL_PORT cannot be 0".to_string()));
        }
        if self.threshold == 0 {
            return Err(ConfigError::InvalidValue("CATCHALL_THRESHOLD must be at least 1".to_string()));
        }
        if self.liveness_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "CATCHALL_LIVENESS_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// `host:port` as announced to and queried by peers
    pub fn node_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Initial host snapshot: this node first, then seeds, without duplicates
    pub fn initial_hosts(&self) -> Vec<String> {
        let mut hosts = vec![self.node_address()];
        for seed in &self.seed_hosts {
            if !hosts.contains(seed) {
                hosts.push(seed.clone());
            }
        }
        hosts
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            threshold: self.threshold,
            retry_after: self.retry_insert,
            store_timeout: self.store_timeout,
        }
    }

    pub fn persistence_config(&self) -> PersistenceConfig {
        PersistenceConfig {
            file_path: self.warm_start_path.clone(),
            autosave_interval: self.autosave_interval,
        }
    }
}
