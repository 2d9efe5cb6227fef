//! Append-only detection event log.
//!
//! Every processed frame becomes one row in `presence_logs`. Rows carry a
//! `try_id` that counts attempts per exact method string: for any method the
//! values run 1, 2, 3, ... with no gaps or repeats, even when several
//! workers (or several processes sharing the file) record at once.

use crate::error::{PresenceError, Result};
use crate::pipeline::Verdict;
use parking_lot::Mutex;
use rusqlite::{params, Connection, TransactionBehavior};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Format of the `timestamp` column
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Rows returned by the history endpoint when no limit is given
pub const DEFAULT_HISTORY_LIMIT: usize = 150;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS presence_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL,
    presence INTEGER NOT NULL,
    fallback_used INTEGER NOT NULL,
    method TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    try_id INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS presence_logs_method_try
    ON presence_logs (method, try_id);
";

/// A row about to be written; `try_id` is assigned by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub filename: String,
    pub presence: bool,
    pub fallback_used: bool,
    pub method: String,
    pub timestamp: String,
}

impl NewEvent {
    pub fn from_verdict(verdict: &Verdict, filename: &str) -> Self {
        Self {
            filename: filename.to_string(),
            presence: verdict.presence,
            fallback_used: verdict.fallback_used,
            method: verdict.method.clone(),
            timestamp: verdict.timestamp.format(TIMESTAMP_FORMAT).to_string(),
        }
    }
}

/// Identifiers the store assigned to a recorded event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoredEvent {
    pub id: i64,
    pub try_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    pub id: i64,
    pub filename: String,
    pub presence: i64,
    pub fallback_used: i64,
    pub method: String,
    pub timestamp: String,
    pub try_id: i64,
}

impl EventRecord {
    /// Column order consumed by history viewers:
    /// filename, presence, fallback_used, method, timestamp, try_id
    pub fn to_row(&self) -> (String, i64, i64, String, String, i64) {
        (
            self.filename.clone(),
            self.presence,
            self.fallback_used,
            self.method.clone(),
            self.timestamp.clone(),
            self.try_id,
        )
    }
}

pub struct EventStore {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl EventStore {
    /// Open (and if needed create) the event database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).map_err(|e| {
            PresenceError::storage(
                "event_store".to_string(),
                format!("cannot open {}: {}", path.display(), e),
            )
        })?;
        let store = Self::init(conn, Some(path.to_path_buf()))?;
        info!("Event store ready at {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append `event`, assigning the next `try_id` for its method.
    ///
    /// The max lookup and the insert share one IMMEDIATE transaction, which
    /// takes SQLite's write lock up front; other writers queue on the busy
    /// timeout instead of reading a stale maximum.
    pub fn record(&self, event: &NewEvent) -> Result<StoredEvent> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let try_id: i64 = tx.query_row(
            "SELECT COALESCE(MAX(try_id), 0) + 1 FROM presence_logs WHERE method = ?1",
            params![event.method],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO presence_logs (filename, presence, fallback_used, method, timestamp, try_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.filename,
                event.presence as i64,
                event.fallback_used as i64,
                event.method,
                event.timestamp,
                try_id
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        debug!(
            "Recorded event {} ({} try {}) for {}",
            id, event.method, try_id, event.filename
        );
        Ok(StoredEvent { id, try_id })
    }

    /// Newest events first, optionally for one method only
    pub fn history(&self, method: Option<&str>, limit: usize) -> Result<Vec<EventRecord>> {
        let conn = self.conn.lock();
        let limit = limit as i64;

        let mut stmt = conn.prepare(
            "SELECT id, filename, presence, fallback_used, method, timestamp, try_id \
             FROM presence_logs \
             WHERE (?1 IS NULL OR method = ?1) \
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![method, limit], |row| {
            Ok(EventRecord {
                id: row.get(0)?,
                filename: row.get(1)?,
                presence: row.get(2)?,
                fallback_used: row.get(3)?,
                method: row.get(4)?,
                timestamp: row.get(5)?,
                try_id: row.get(6)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM presence_logs", [], |row| row.get(0))?)
    }

    /// Delete every event
    pub fn clear_all(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM presence_logs", [])?;
        info!("Cleared all {} events", deleted);
        Ok(deleted)
    }

    /// Delete the `n` most recent events
    pub fn clear_last(&self, n: usize) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM presence_logs WHERE id IN \
             (SELECT id FROM presence_logs ORDER BY id DESC LIMIT ?1)",
            params![n as i64],
        )?;
        info!("Cleared the last {} events", deleted);
        Ok(deleted)
    }
}
