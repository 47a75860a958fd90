//! Durable record of per-file processing outcomes.
//!
//! The ledger answers one question: has this exact content already been
//! converted? It is a SQLite database with two tables:
//!
//! - `processed_files`: one row per successfully converted source, keyed by
//!   path, holding the fingerprint it was converted at.
//! - `failed_files`: one row per source whose last attempt failed, with a
//!   retry counter.
//!
//! A success removes the failure row of the same path in the same
//! transaction. Every mutation is its own transaction and the connection sits
//! behind a mutex, so parallel workers share one writer.

use crate::category::EntityCategory;
use crate::error::SyncError;
use crate::hasher::Fingerprint;
use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

type LedgerResult<T> = Result<T, SyncError>;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS processed_files (
    file_path TEXT PRIMARY KEY,
    file_hash TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    processed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    file_size INTEGER,
    record_count INTEGER,
    output_path TEXT
);
CREATE TABLE IF NOT EXISTS failed_files (
    file_path TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    error_message TEXT,
    failed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    retry_count INTEGER DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_entity_type ON processed_files(entity_type);
CREATE INDEX IF NOT EXISTS idx_failed_entity_type ON failed_files(entity_type);
";

/// A successful conversion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    pub category: EntityCategory,
    pub processed_at: DateTime<Utc>,
    pub size: u64,
    pub record_count: u64,
    pub output_path: PathBuf,
}

/// The last failed attempt of a source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailureEntry {
    pub path: PathBuf,
    pub category: EntityCategory,
    pub message: String,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
}

/// Aggregates of one category.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CategoryStats {
    pub files: u64,
    pub records: u64,
    pub bytes: u64,
    pub failures: u64,
}

/// Aggregates of every category present in the ledger.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub categories: BTreeMap<EntityCategory, CategoryStats>,
}

impl LedgerStats {
    /// Stats of `category`, zero when absent.
    #[must_use]
    pub fn category(&self, category: EntityCategory) -> CategoryStats {
        self.categories.get(&category).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn total_files(&self) -> u64 {
        self.categories.values().map(|s| s.files).sum()
    }

    #[must_use]
    pub fn total_records(&self) -> u64 {
        self.categories.values().map(|s| s.records).sum()
    }

    #[must_use]
    pub fn total_failures(&self) -> u64 {
        self.categories.values().map(|s| s.failures).sum()
    }
}

/// SQLite-backed processing ledger.
pub struct ProcessingLedger {
    conn: Mutex<Connection>,
}

impl ProcessingLedger {
    /// Open (or create) the ledger database at `path`.
    ///
    /// # Errors
    /// Returns an error if the parent directory cannot be created or the
    /// database cannot be opened and initialised.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("mkdir -p {}", parent.display()))?;
        }
        let conn =
            Connection::open(path).with_context(|| format!("open ledger {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(30))
            .context("set ledger busy timeout")?;
        let mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .context("enable WAL journal")?;
        debug!(journal_mode = %mode, "ledger journal mode");

        let ledger = Self::from_connection(conn)?;
        info!(path = %path.display(), "ledger initialised");
        Ok(ledger)
    }

    /// A throwaway in-memory ledger.
    ///
    /// # Errors
    /// Returns an error if SQLite cannot create the database.
    pub fn open_in_memory() -> LedgerResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> LedgerResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> LedgerResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SyncError::LedgerPoisoned)
    }

    /// True iff `path` was converted at exactly `fingerprint`.
    ///
    /// # Errors
    /// Returns [`SyncError::Ledger`] if the query fails.
    pub fn is_processed(&self, path: &Path, fingerprint: &Fingerprint) -> LedgerResult<bool> {
        let conn = self.lock()?;
        let stored: Option<String> = conn
            .query_row(
                "SELECT file_hash FROM processed_files WHERE file_path = ?1",
                params![key(path)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stored.is_some_and(|h| h == fingerprint.as_str()))
    }

    /// Record a successful conversion and drop any failure history of `path`.
    ///
    /// # Errors
    /// Returns [`SyncError::Ledger`] if the transaction fails; nothing is
    /// changed in that case.
    pub fn mark_processed(
        &self,
        path: &Path,
        fingerprint: &Fingerprint,
        category: EntityCategory,
        size: u64,
        record_count: u64,
        output_path: &Path,
    ) -> LedgerResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO processed_files
             (file_path, file_hash, entity_type, file_size, record_count, output_path, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                key(path),
                fingerprint.as_str(),
                category.as_str(),
                to_sql_int(size),
                to_sql_int(record_count),
                key(output_path),
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.execute(
            "DELETE FROM failed_files WHERE file_path = ?1",
            params![key(path)],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Record a failed attempt, incrementing the retry counter of `path`.
    /// The processed row, if any, is left alone.
    ///
    /// # Errors
    /// Returns [`SyncError::Ledger`] if the statement fails.
    pub fn mark_failed(
        &self,
        path: &Path,
        category: EntityCategory,
        message: &str,
    ) -> LedgerResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO failed_files
             (file_path, entity_type, error_message, failed_at, retry_count)
             VALUES (?1, ?2, ?3, ?4,
                     COALESCE((SELECT retry_count FROM failed_files WHERE file_path = ?1), 0) + 1)",
            params![key(path), category.as_str(), message, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Per-category aggregates over both tables.
    ///
    /// # Errors
    /// Returns [`SyncError::Ledger`] if a query fails.
    pub fn stats(&self) -> LedgerResult<LedgerStats> {
        let conn = self.lock()?;
        let mut stats = LedgerStats::default();

        let mut stmt = conn.prepare(
            "SELECT entity_type, COUNT(*), COALESCE(SUM(record_count), 0), COALESCE(SUM(file_size), 0)
             FROM processed_files GROUP BY entity_type",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        for row in rows {
            let (name, files, records, bytes) = row?;
            let Some(category) = known_category(&name) else {
                continue;
            };
            let entry = stats.categories.entry(category).or_default();
            entry.files = from_sql_int(files);
            entry.records = from_sql_int(records);
            entry.bytes = from_sql_int(bytes);
        }

        let mut stmt =
            conn.prepare("SELECT entity_type, COUNT(*) FROM failed_files GROUP BY entity_type")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (name, failures) = row?;
            if let Some(category) = known_category(&name) {
                stats.categories.entry(category).or_default().failures = from_sql_int(failures);
            }
        }
        Ok(stats)
    }

    /// Delete every processed and failed row of `category`. Returns the
    /// number of rows removed from both tables.
    ///
    /// # Errors
    /// Returns [`SyncError::Ledger`] if the transaction fails.
    pub fn clear_category(&self, category: EntityCategory) -> LedgerResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let processed = tx.execute(
            "DELETE FROM processed_files WHERE entity_type = ?1",
            params![category.as_str()],
        )?;
        let failed = tx.execute(
            "DELETE FROM failed_files WHERE entity_type = ?1",
            params![category.as_str()],
        )?;
        tx.commit()?;
        info!(%category, processed, failed, "cleared ledger rows");
        Ok(processed + failed)
    }

    /// Remove both rows of one path. Returns whether anything was removed.
    ///
    /// # Errors
    /// Returns [`SyncError::Ledger`] if the transaction fails.
    pub fn forget(&self, path: &Path) -> LedgerResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let processed = tx.execute(
            "DELETE FROM processed_files WHERE file_path = ?1",
            params![key(path)],
        )?;
        let failed = tx.execute(
            "DELETE FROM failed_files WHERE file_path = ?1",
            params![key(path)],
        )?;
        tx.commit()?;
        Ok(processed + failed > 0)
    }

    /// The processed row of `path`.
    ///
    /// # Errors
    /// Returns [`SyncError::Ledger`] if the query fails or the row is corrupt.
    pub fn entry(&self, path: &Path) -> LedgerResult<Option<LedgerEntry>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT file_path, file_hash, entity_type, processed_at, file_size, record_count, output_path
                 FROM processed_files WHERE file_path = ?1",
                params![key(path)],
                ledger_entry_from_row,
            )
            .optional()?)
    }

    /// The failure row of `path`.
    ///
    /// # Errors
    /// Returns [`SyncError::Ledger`] if the query fails or the row is corrupt.
    pub fn failure(&self, path: &Path) -> LedgerResult<Option<FailureEntry>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT file_path, entity_type, error_message, failed_at, retry_count
                 FROM failed_files WHERE file_path = ?1",
                params![key(path)],
                failure_entry_from_row,
            )
            .optional()?)
    }

    /// All failure rows, optionally restricted to one category, by path.
    ///
    /// # Errors
    /// Returns [`SyncError::Ledger`] if the query fails or a row is corrupt.
    pub fn failures(&self, category: Option<EntityCategory>) -> LedgerResult<Vec<FailureEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT file_path, entity_type, error_message, failed_at, retry_count
             FROM failed_files
             WHERE ?1 IS NULL OR entity_type = ?1
             ORDER BY file_path",
        )?;
        let rows = stmt.query_map(
            params![category.map(EntityCategory::as_str)],
            failure_entry_from_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn to_sql_int(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn from_sql_int(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

fn known_category(name: &str) -> Option<EntityCategory> {
    match name.parse() {
        Ok(c) => Some(c),
        Err(_) => {
            warn!(entity_type = name, "ignoring ledger rows of unknown category");
            None
        }
    }
}

fn conversion_failure(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn category_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<EntityCategory> {
    row.get::<_, String>(idx)?
        .parse()
        .map_err(|e| conversion_failure(idx, e))
}

/// Accepts RFC 3339 and SQLite's `CURRENT_TIMESTAMP` format.
fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let Some(text) = row.get::<_, Option<String>>(idx)? else {
        return Ok(DateTime::<Utc>::UNIX_EPOCH);
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(&text) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| conversion_failure(idx, e))
}

fn ledger_entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    Ok(LedgerEntry {
        path: PathBuf::from(row.get::<_, String>(0)?),
        fingerprint: Fingerprint::from_hex(row.get::<_, String>(1)?),
        category: category_column(row, 2)?,
        processed_at: timestamp_column(row, 3)?,
        size: from_sql_int(row.get::<_, Option<i64>>(4)?.unwrap_or(0)),
        record_count: from_sql_int(row.get::<_, Option<i64>>(5)?.unwrap_or(0)),
        output_path: PathBuf::from(row.get::<_, Option<String>>(6)?.unwrap_or_default()),
    })
}

fn failure_entry_from_row(row: &Row<'_>) -> rusqlite::Result<FailureEntry> {
    Ok(FailureEntry {
        path: PathBuf::from(row.get::<_, String>(0)?),
        category: category_column(row, 1)?,
        message: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        failed_at: timestamp_column(row, 3)?,
        retry_count: u32::try_from(row.get::<_, i64>(4)?).unwrap_or(0),
    })
}
