//! SQLite ledger of documents the indexer has looked at.
//!
//! One row per storage key. Rows are created on the first attempt and
//! updated in place afterwards; `retry_count` only moves through
//! [`Ledger::increment_retry`].

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{AppError, Result};
use crate::models::{LedgerStatus, ProcessedEntry};

/// Processed-documents ledger.
pub struct Ledger {
    conn: Mutex<Connection>,
}

impl Ledger {
    /// Open (or create) the ledger at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    /// Ledger that lives only as long as the process.
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS processed (
                key TEXT PRIMARY KEY,
                processed_at TEXT NOT NULL,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                file_type TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_processed_status ON processed(status);
        "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn connect(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::storage("ledger connection poisoned"))
    }

    /// Whether `key` has any entry.
    pub fn contains(&self, key: &str) -> Result<bool> {
        let conn = self.connect()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM processed WHERE key = ?",
                params![key],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Get the entry for `key`.
    pub fn get(&self, key: &str) -> Result<Option<ProcessedEntry>> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT key, status, retry_count, last_error, file_type, processed_at
                 FROM processed WHERE key = ?",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        row.map(
            |(key, status, retry_count, last_error, file_type, processed_at)| -> Result<ProcessedEntry> {
                Ok(ProcessedEntry {
                    key,
                    status: status.parse()?,
                    retry_count,
                    last_error,
                    file_type,
                    processed_at,
                })
            },
        )
        .transpose()
    }

    /// Record an outcome, keeping any existing retry count.
    pub fn record(
        &self,
        key: &str,
        status: LedgerStatus,
        file_type: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO processed (key, processed_at, status, retry_count, last_error, file_type)
             VALUES (?1, ?2, ?3, 0, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                processed_at = excluded.processed_at,
                status = excluded.status,
                last_error = excluded.last_error,
                file_type = excluded.file_type",
            params![key, Utc::now().to_rfc3339(), status.as_str(), error, file_type],
        )?;
        Ok(())
    }

    /// Failed keys still under the retry budget, oldest attempt first.
    pub fn failed_keys(&self, max_retries: u32, limit: usize) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT key FROM processed
             WHERE status = 'failed' AND retry_count < ?1
             ORDER BY processed_at ASC
             LIMIT ?2",
        )?;
        let keys = stmt
            .query_map(params![max_retries, limit as i64], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    /// Bump the retry counter for `key`.
    pub fn increment_retry(&self, key: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE processed SET retry_count = retry_count + 1 WHERE key = ?",
            params![key],
        )?;
        Ok(())
    }

    /// Every key with an entry.
    pub fn known_keys(&self) -> Result<HashSet<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT key FROM processed")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<HashSet<String>, _>>()?;
        Ok(keys)
    }

    /// Number of entries per status.
    pub fn status_counts(&self) -> Result<Vec<(String, u64)>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM processed GROUP BY status ORDER BY status")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(counts
            .into_iter()
            .map(|(status, count)| (status, count.max(0) as u64))
            .collect())
    }
}
