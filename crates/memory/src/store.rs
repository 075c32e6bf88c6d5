//! Durable storage for turn records.
//!
//! Three backends:
//! - [`InMemoryTurnStore`]: a map of vectors, for tests and ephemeral runs
//! - [`JsonlTurnStore`]: one JSON-lines file per session under a directory
//! - [`NoopTurnStore`]: stores nothing
//!
//! Storage is best effort from the agent's point of view. The persistence
//! writer logs failures and carries on.

use async_trait::async_trait;
use clawlink_core::message::TurnRecord;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize turn record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Append-only persistence of a session's records.
#[async_trait]
pub trait TurnStore: Send + Sync {
    fn name(&self) -> &str;

    /// Persist one record at the end of the session's log.
    async fn append(&self, session_id: &str, record: &TurnRecord) -> Result<(), StoreError>;

    /// All records stored for a session, oldest first. Empty if unknown.
    async fn load(&self, session_id: &str) -> Result<Vec<TurnRecord>, StoreError>;
}

/// Keeps everything in process memory.
#[derive(Default)]
pub struct InMemoryTurnStore {
    sessions: RwLock<HashMap<String, Vec<TurnRecord>>>,
}

impl InMemoryTurnStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TurnStore for InMemoryTurnStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, session_id: &str, record: &TurnRecord) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Vec<TurnRecord>, StoreError> {
        Ok(self.sessions.read().await.get(session_id).cloned().unwrap_or_default())
    }
}

/// One `<session>.jsonl` file per session, one record per line.
pub struct JsonlTurnStore {
    dir: PathBuf,
}

impl JsonlTurnStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// File for a session. Characters outside `[A-Za-z0-9_-]` are replaced so
    /// a session code can never escape the directory.
    pub fn session_path(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl TurnStore for JsonlTurnStore {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn append(&self, session_id: &str, record: &TurnRecord) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, e))?;

        let path = self.session_path(session_id);
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        file.write_all(line.as_bytes()).await.map_err(|e| io_error(&path, e))?;
        file.flush().await.map_err(|e| io_error(&path, e))?;
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Vec<TurnRecord>, StoreError> {
        let path = self.session_path(session_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&path, e)),
        };

        let records: Vec<TurnRecord> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<TurnRecord>(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(session_id, error = %e, "Skipping corrupted turn record");
                    None
                }
            })
            .collect();

        debug!(session_id, count = records.len(), "Loaded session history");
        Ok(records)
    }
}

/// Discards everything.
pub struct NoopTurnStore;

#[async_trait]
impl TurnStore for NoopTurnStore {
    fn name(&self) -> &str {
        "none"
    }

    async fn append(&self, _session_id: &str, _record: &TurnRecord) -> Result<(), StoreError> {
        Ok(())
    }

    async fn load(&self, _session_id: &str) -> Result<Vec<TurnRecord>, StoreError> {
        Ok(Vec::new())
    }
}
