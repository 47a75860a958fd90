//! The synchronization engine.
//!
//! One run walks every configured category and drives each discovered source
//! file through the same state machine:
//!
//! ```text
//! discovered -> fingerprinted -> SKIPPED            (ledger has this fingerprint)
//!                             -> converted -> PROCESSED
//!                                          -> FAILED  (error log + failure row)
//!            -> VANISHED                            (deleted upstream meanwhile)
//! ```
//!
//! Per-file errors never leave [`SyncEngine::process_file`]; only ledger
//! errors do, and they abort the run. After the conversion pass the orphan
//! sweep runs, the ledger rows of removed orphans are dropped (unless
//! configured otherwise), and the run summary is written.

use crate::category::EntityCategory;
use crate::config::{ExecMode, SyncConfig};
use crate::convert::ConversionEngine;
use crate::discovery::{SourceFile, discover};
use crate::error::SyncError;
use crate::hasher::fingerprint;
use crate::ledger::{LedgerStats, ProcessingLedger};
use crate::normalization::NormalizationPolicy;
use crate::paths::PathMapper;
use crate::reconcile::{ReconcileMode, ReconcileStats, reconcile};
use crate::report::{ErrorLog, RunSummary};
use anyhow::{Context, Result, anyhow};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Terminal state of one file in one run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileOutcome {
    Skipped,
    Processed { records: u64 },
    Failed { error: String },
    Vanished,
}

/// Counters of one category (or of the whole run, see [`RunStats::totals`]).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CategoryRunStats {
    pub discovered: u64,
    pub skipped: u64,
    pub processed: u64,
    pub failed: u64,
    pub vanished: u64,
    pub records_added: u64,
}

impl CategoryRunStats {
    fn record(&mut self, outcome: &FileOutcome) {
        match outcome {
            FileOutcome::Skipped => self.skipped += 1,
            FileOutcome::Processed { records } => {
                self.processed += 1;
                self.records_added += records;
            }
            FileOutcome::Failed { .. } => self.failed += 1,
            FileOutcome::Vanished => self.vanished += 1,
        }
    }

    fn merge(&mut self, other: &Self) {
        self.discovered += other.discovered;
        self.skipped += other.skipped;
        self.processed += other.processed;
        self.failed += other.failed;
        self.vanished += other.vanished;
        self.records_added += other.records_added;
    }
}

/// Per-category counters of one run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub categories: BTreeMap<EntityCategory, CategoryRunStats>,
}

impl RunStats {
    /// Counters of `category`, zero when it had no files.
    #[must_use]
    pub fn category(&self, category: EntityCategory) -> CategoryRunStats {
        self.categories.get(&category).copied().unwrap_or_default()
    }

    /// Sum over all categories.
    #[must_use]
    pub fn totals(&self) -> CategoryRunStats {
        let mut total = CategoryRunStats::default();
        for s in self.categories.values() {
            total.merge(s);
        }
        total
    }
}

/// Everything a run produced.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub stats: RunStats,
    /// `None` when reconciliation is disabled.
    pub reconciliation: Option<ReconcileStats>,
    /// Ledger aggregates after the run.
    pub ledger: LedgerStats,
    pub duration: Duration,
}

impl RunReport {
    /// A run succeeds when no file failed. Orphan activity does not count.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.stats.totals().failed == 0
    }

    /// Process exit status for this run.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.succeeded())
    }
}

/// Drives discovery, conversion, ledger updates and reconciliation.
pub struct SyncEngine {
    config: SyncConfig,
    mapper: PathMapper,
    ledger: ProcessingLedger,
    policy: Arc<NormalizationPolicy>,
    converter: Arc<dyn ConversionEngine>,
    error_log: ErrorLog,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        ledger: ProcessingLedger,
        policy: NormalizationPolicy,
        converter: impl ConversionEngine + 'static,
    ) -> Self {
        Self {
            mapper: config.path_mapper(),
            error_log: ErrorLog::new(config.error_log.clone()),
            config,
            ledger,
            policy: Arc::new(policy),
            converter: Arc::new(converter),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    #[must_use]
    pub fn ledger(&self) -> &ProcessingLedger {
        &self.ledger
    }

    /// Execute one full synchronization pass.
    ///
    /// # Errors
    /// Returns an error only for run-level failures: the ledger is
    /// unavailable, a source directory cannot be walked, or the worker pool
    /// cannot be built. Individual file failures are reported in the
    /// returned [`RunReport`].
    pub fn run(&self) -> Result<RunReport> {
        let started = Instant::now();
        info!(
            source = %self.mapper.source_root().display(),
            dest = %self.mapper.dest_root().display(),
            categories = self.config.categories.len(),
            "starting sync run"
        );

        for &category in &self.config.force_categories {
            info!(%category, "forcing full reconversion");
            self.ledger.clear_category(category)?;
        }

        let pool = match self.config.exec_mode {
            ExecMode::Sequential => None,
            ExecMode::Parallel { threads } => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads.unwrap_or_else(num_cpus::get).max(1))
                    .thread_name(|i| format!("openalex-sync-{i}"))
                    .build()
                    .context("build conversion thread pool")?,
            ),
        };

        let mut stats = RunStats::default();
        for group in discover(&self.mapper, &self.config.categories)? {
            let outcomes = match &pool {
                None => group
                    .files
                    .iter()
                    .map(|f| self.process_file(f))
                    .collect::<Result<Vec<_>, _>>()?,
                Some(pool) => pool.install(|| {
                    group
                        .files
                        .par_iter()
                        .map(|f| self.process_file(f))
                        .collect::<Result<Vec<_>, _>>()
                })?,
            };

            let mut cat = CategoryRunStats {
                discovered: group.files.len() as u64,
                ..CategoryRunStats::default()
            };
            for outcome in &outcomes {
                cat.record(outcome);
            }
            if cat.discovered > 0 {
                info!(
                    category = %group.category,
                    processed = cat.processed,
                    skipped = cat.skipped,
                    failed = cat.failed,
                    vanished = cat.vanished,
                    records = cat.records_added,
                    "category done"
                );
            }
            stats.categories.insert(group.category, cat);
        }

        let reconciliation = if self.config.reconcile_orphans {
            let recon = reconcile(&self.mapper, &self.config.categories, ReconcileMode::Delete);
            if self.config.invalidate_orphan_ledger_rows {
                for source in &recon.removed_sources {
                    if self.ledger.forget(source)? {
                        debug!(path = %source.display(), "dropped ledger rows of orphan");
                    }
                }
            }
            Some(recon)
        } else {
            None
        };

        let report = RunReport {
            stats,
            reconciliation,
            ledger: self.ledger.stats()?,
            duration: started.elapsed(),
        };

        let totals = report.stats.totals();
        info!(
            processed = totals.processed,
            skipped = totals.skipped,
            failed = totals.failed,
            vanished = totals.vanished,
            records_added = totals.records_added,
            duration_secs = report.duration.as_secs_f64(),
            "sync run finished"
        );

        if let Some(path) = &self.config.summary_path {
            if let Err(e) = RunSummary::from_report(&report).save_to_file(path) {
                warn!(path = %path.display(), error = %format!("{e:#}"), "could not write run summary");
            }
        }
        Ok(report)
    }

    /// Drive one file to its terminal state.
    ///
    /// # Errors
    /// Only ledger failures are returned; every other error becomes a
    /// [`FileOutcome::Failed`] or [`FileOutcome::Vanished`].
    pub fn process_file(&self, file: &SourceFile) -> Result<FileOutcome, SyncError> {
        let path = &file.path;
        let fp = match fingerprint(path) {
            Ok(fp) => fp,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let e = SyncError::Vanished { path: path.clone() };
                warn!(category = %file.category, error = %e, "skipping file");
                return Ok(FileOutcome::Vanished);
            }
            Err(e) => return self.fail(file, &format!("fingerprint: {e}")),
        };

        if self.ledger.is_processed(path, &fp)? {
            debug!(path = %path.display(), "unchanged, skipping");
            return Ok(FileOutcome::Skipped);
        }

        let output = match self.mapper.output_for(path) {
            Ok(output) => output,
            Err(e) => return self.fail(file, &e.to_string()),
        };
        let size = fs::metadata(path).map_or(file.size, |m| m.len());

        let job = ConversionJob {
            converter: Arc::clone(&self.converter),
            policy: Arc::clone(&self.policy),
            category: file.category,
            source: path.clone(),
            output: output.clone(),
        };
        match self.run_with_deadline(job) {
            Ok(records) => {
                self.ledger
                    .mark_processed(path, &fp, file.category, size, records, &output)?;
                info!(
                    path = %path.display(),
                    output = %output.display(),
                    records,
                    "converted"
                );
                Ok(FileOutcome::Processed { records })
            }
            Err(_) if !path.exists() => {
                let e = SyncError::Vanished { path: path.clone() };
                warn!(category = %file.category, error = %e, "source removed during conversion");
                Ok(FileOutcome::Vanished)
            }
            Err(e) => self.fail(file, &format!("{e:#}")),
        }
    }

    fn fail(&self, file: &SourceFile, message: &str) -> Result<FileOutcome, SyncError> {
        error!(
            path = %file.path.display(),
            category = %file.category,
            error = message,
            "conversion failed"
        );
        self.error_log
            .append(&format!("Failed to process {}: {message}", file.path.display()));
        self.ledger.mark_failed(&file.path, file.category, message)?;
        Ok(FileOutcome::Failed {
            error: message.to_string(),
        })
    }

    fn run_with_deadline(&self, job: ConversionJob) -> Result<u64> {
        let Some(after) = self.config.file_timeout else {
            return job.run();
        };
        let path = job.source.clone();
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("openalex-sync-convert".to_string())
            .spawn(move || {
                // The receiver is gone once the deadline passed.
                let _ = tx.send(job.run());
            })
            .context("spawn conversion thread")?;
        match rx.recv_timeout(after) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(SyncError::Timeout { path, after }.into()),
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!(
                "conversion of {} aborted (worker thread panicked)",
                path.display()
            )),
        }
    }
}

/// Owned inputs of one conversion, so it can run on a helper thread.
struct ConversionJob {
    converter: Arc<dyn ConversionEngine>,
    policy: Arc<NormalizationPolicy>,
    category: EntityCategory,
    source: PathBuf,
    output: PathBuf,
}

impl ConversionJob {
    fn run(&self) -> Result<u64> {
        let projection = if self.policy.needs_normalization(self.category) {
            match self.converter.describe_columns(&self.source) {
                Ok(columns) => {
                    let projection = self.policy.build_projection(self.category, &columns);
                    debug!(
                        path = %self.source.display(),
                        coerced = projection.coerced(),
                        select = %projection,
                        "normalizing"
                    );
                    Some(projection)
                }
                Err(e) => {
                    warn!(
                        path = %self.source.display(),
                        error = %format!("{e:#}"),
                        "column introspection failed, converting without normalization"
                    );
                    None
                }
            }
        } else {
            None
        };
        self.converter
            .convert(&self.source, &self.output, projection.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_sum_categories() {
        let mut stats = RunStats::default();
        let mut a = CategoryRunStats::default();
        a.record(&FileOutcome::Processed { records: 5 });
        a.record(&FileOutcome::Skipped);
        let mut b = CategoryRunStats::default();
        b.record(&FileOutcome::Failed {
            error: "x".to_string(),
        });
        b.record(&FileOutcome::Vanished);
        stats.categories.insert(EntityCategory::Authors, a);
        stats.categories.insert(EntityCategory::Works, b);

        let t = stats.totals();
        assert_eq!(
            (t.processed, t.skipped, t.failed, t.vanished, t.records_added),
            (1, 1, 1, 1, 5)
        );
        assert_eq!(stats.category(EntityCategory::Topics), CategoryRunStats::default());
    }

    #[test]
    fn exit_code_reflects_failures_only() {
        let mut report = RunReport {
            stats: RunStats::default(),
            reconciliation: Some(ReconcileStats {
                removed: 3,
                ..ReconcileStats::default()
            }),
            ledger: LedgerStats::default(),
            duration: Duration::ZERO,
        };
        assert_eq!(report.exit_code(), 0);
        report.stats.categories.insert(
            EntityCategory::Works,
            CategoryRunStats {
                failed: 1,
                ..CategoryRunStats::default()
            },
        );
        assert_eq!(report.exit_code(), 1);
    }
}
