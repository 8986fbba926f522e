//! Warm-start file for the write-back cache
//!
//! Newline-delimited `domain,counter` rows, written as a full overwrite.
//! Counters use the file encoding of [`CounterState`] (`-1` bounced,
//! `-2` bounce not yet flushed). The file is a convenience for restarting
//! the same node, never a source of truth: it may lag the durable store.

use crate::cache::WriteBackCache;
use crate::model::CounterState;
use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub enum PersistenceError {
    Io(std::io::Error),
    Parse { line: usize, reason: String },
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        PersistenceError::Io(err)
    }
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistenceError::Io(e) => write!(f, "IO error: {}", e),
            PersistenceError::Parse { line, reason } => {
                write!(f, "Invalid row at line {}: {}", line, reason)
            }
        }
    }
}

impl std::error::Error for PersistenceError {}

/// Warm-start configuration
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub file_path: PathBuf,
    /// Zero disables the background autosave; the file is then only
    /// written at shutdown
    pub autosave_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            file_path: PathBuf::from("queue.csv"),
            autosave_interval: Duration::ZERO,
        }
    }
}

/// Write every counter to `path`, replacing any previous content
///
/// Domains containing a line break cannot be represented in the row format
/// and are skipped. Returns the number of rows written.
pub fn save_counters(
    rows: &[(String, CounterState)],
    path: impl AsRef<Path>,
) -> Result<usize, PersistenceError> {
    let mut out = String::with_capacity(rows.len() * 24);
    let mut written = 0;
    for (domain, state) in rows {
        if domain.contains(|c: char| c == '\n' || c == '\r') {
            log::warn!("Not saving counter for domain with a line break: {:?}", domain);
            continue;
        }
        let _ = writeln!(out, "{},{}", domain, state.file_value());
        written += 1;
    }
    fs::write(path.as_ref(), out)?;

    log::debug!("Saved {} counters to {}", written, path.as_ref().display());
    Ok(written)
}

/// Read counters back from `path`
///
/// A missing file yields an empty list. Rows that do not parse are logged
/// and skipped.
pub fn load_counters(path: impl AsRef<Path>) -> Result<Vec<(String, CounterState)>, PersistenceError> {
    let path = path.as_ref();
    if !path.exists() {
        log::info!("No existing warm-start file found: {}", path.display());
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path)?;
    let mut rows = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_row(idx + 1, line) {
            Ok(row) => rows.push(row),
            Err(e) => log::warn!("Skipping warm-start row: {}", e),
        }
    }

    log::info!("Loaded {} counters from {}", rows.len(), path.display());
    Ok(rows)
}

fn parse_row(line: usize, row: &str) -> Result<(String, CounterState), PersistenceError> {
    let (domain, counter) = row.rsplit_once(',').ok_or_else(|| PersistenceError::Parse {
        line,
        reason: "missing ',' separator".to_string(),
    })?;

    if domain.is_empty() {
        return Err(PersistenceError::Parse { line, reason: "empty domain".to_string() });
    }

    let value: i64 = counter.trim().parse().map_err(|e| PersistenceError::Parse {
        line,
        reason: format!("bad counter '{}': {}", counter, e),
    })?;

    let state = CounterState::from_file_value(value).ok_or_else(|| PersistenceError::Parse {
        line,
        reason: format!("unknown counter code {}", value),
    })?;

    Ok((domain.to_string(), state))
}

/// Background task that periodically rewrites the warm-start file
///
/// Returns immediately when autosave is disabled; otherwise runs until
/// `shutdown` is cancelled.
pub async fn persistence_task(
    cache: Arc<WriteBackCache>,
    config: PersistenceConfig,
    shutdown: CancellationToken,
) {
    if config.autosave_interval.is_zero() {
        return;
    }

    let mut interval_timer = interval(config.autosave_interval);
    // First tick completes immediately; nothing worth saving yet
    interval_timer.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval_timer.tick() => {
                if let Err(e) = cache.persist(&config.file_path).await {
                    log::warn!("Failed to autosave warm-start file: {}", e);
                }
            }
        }
    }
}
