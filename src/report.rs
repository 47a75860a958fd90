//! End-of-run artifacts: the JSON run summary and the append-only error log.

use crate::category::EntityCategory;
use crate::ledger::LedgerStats;
use crate::sync::RunReport;
use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::warn;

/// Files and records of one category, as recorded in the ledger.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTotals {
    pub files: u64,
    pub records: u64,
}

/// Summary artifact consumed by notification and monitoring jobs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub success: bool,
    pub files_processed: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub files_vanished: u64,
    pub duration_seconds: f64,
    /// Records converted during this run.
    pub records_added: u64,
    /// Records across the whole ledger after this run.
    pub records_total: u64,
    pub orphans_removed: u64,
    pub orphans_scanned: u64,
    pub orphans_kept: u64,
    pub orphan_errors: u64,
    pub entity_stats: BTreeMap<EntityCategory, EntityTotals>,
    /// RFC 3339, UTC.
    pub timestamp: String,
}

impl RunSummary {
    #[must_use]
    pub fn from_report(report: &RunReport) -> Self {
        let totals = report.stats.totals();
        let recon = report.reconciliation.clone().unwrap_or_default();
        Self {
            success: report.succeeded(),
            files_processed: totals.processed,
            files_skipped: totals.skipped,
            files_failed: totals.failed,
            files_vanished: totals.vanished,
            duration_seconds: report.duration.as_secs_f64(),
            records_added: totals.records_added,
            records_total: report.ledger.total_records(),
            orphans_removed: recon.removed,
            orphans_scanned: recon.scanned,
            orphans_kept: recon.kept,
            orphan_errors: recon.errors,
            entity_stats: entity_totals(&report.ledger),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    /// Write the summary as pretty JSON, creating parent directories.
    ///
    /// # Errors
    /// Returns an error if the directory or file cannot be written.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("serialize run summary")?;
        fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Read a summary written by [`RunSummary::save_to_file`].
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))
    }
}

fn entity_totals(stats: &LedgerStats) -> BTreeMap<EntityCategory, EntityTotals> {
    stats
        .categories
        .iter()
        .map(|(c, s)| {
            (
                *c,
                EntityTotals {
                    files: s.files,
                    records: s.records,
                },
            )
        })
        .collect()
}

/// Append-only text log of failed conversion attempts.
///
/// One line per failure: `<RFC 3339 timestamp> | <message>`. Write errors are
/// reported through `tracing` and otherwise ignored.
pub struct ErrorLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl ErrorLog {
    /// Lazily opened on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one message.
    pub fn append(&self, message: &str) {
        if let Err(e) = self.try_append(message) {
            warn!(path = %self.path.display(), error = %e, "could not write error log");
        }
    }

    fn try_append(&self, message: &str) -> Result<()> {
        let mut slot = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("mkdir -p {}", parent.display()))?;
            }
            let f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("open {}", self.path.display()))?;
            *slot = Some(f);
        }
        if let Some(f) = slot.as_mut() {
            let line = format!(
                "{} | {}\n",
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                message.replace('\n', " ")
            );
            f.write_all(line.as_bytes()).context("append to error log")?;
            f.flush().context("flush error log")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn error_log_appends_timestamped_lines() {
        let tmp = TempDir::new().unwrap();
        let log = ErrorLog::new(tmp.path().join("logs/etl_errors.log"));
        log.append("Failed to process /a.gz: boom");
        log.append("second\nline");
        let text = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" | Failed to process /a.gz: boom"));
        assert!(lines[1].ends_with(" | second line"));
        let ts = lines[0].split(" | ").next().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn unwritable_error_log_does_not_panic() {
        let tmp = TempDir::new().unwrap();
        // A directory cannot be opened for appending.
        let log = ErrorLog::new(tmp.path());
        log.append("ignored");
    }
}
