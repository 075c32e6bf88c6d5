//! Conversation memory — the ordered, append-only turn log of one session.
//!
//! Records are never edited or removed. Once the owning session is closed
//! every read and append fails with [`MemoryError::SessionClosed`], which
//! the executor turns into a failed run.

use clawlink_core::error::MemoryError;
use clawlink_core::message::TurnRecord;
use std::sync::Mutex;

struct Log {
    records: Vec<TurnRecord>,
    closed: bool,
}

/// Append-only log of [`TurnRecord`]s owned by one session.
pub struct ConversationMemory {
    session_id: String,
    log: Mutex<Log>,
}

impl ConversationMemory {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self::with_history(session_id, Vec::new())
    }

    /// Start from previously persisted records.
    pub fn with_history(session_id: impl Into<String>, records: Vec<TurnRecord>) -> Self {
        Self {
            session_id: session_id.into(),
            log: Mutex::new(Log {
                records,
                closed: false,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Append a record, returning its index in the log.
    pub fn append(&self, record: TurnRecord) -> Result<usize, MemoryError> {
        let mut log = self.lock();
        if log.closed {
            return Err(MemoryError::SessionClosed(self.session_id.clone()));
        }
        log.records.push(record);
        Ok(log.records.len() - 1)
    }

    /// A copy of the full log, oldest first.
    pub fn snapshot(&self) -> Result<Vec<TurnRecord>, MemoryError> {
        let log = self.lock();
        if log.closed {
            return Err(MemoryError::SessionClosed(self.session_id.clone()));
        }
        Ok(log.records.clone())
    }

    /// Number of records, readable even after close.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse all further reads and appends. Idempotent.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }
}
