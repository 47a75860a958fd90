//! Run configuration.
//!
//! A [`SyncConfig`] is built once at startup (by the CLI or by a test) and
//! handed by reference to every component. There is no global state.
//!
//! # Usage
//!
//! ```no_run
//! use openalex_sync::config::{ExecMode, SyncConfig};
//! use std::time::Duration;
//!
//! let mut config = SyncConfig::from_project_root("/srv/openalex");
//! config.exec_mode = ExecMode::Parallel { threads: Some(4) };
//! config.file_timeout = Some(Duration::from_secs(600));
//! ```

use crate::category::EntityCategory;
use crate::paths::PathMapper;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How files within a category are converted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ExecMode {
    /// One file at a time, in discovery order.
    #[default]
    Sequential,
    /// Files of a category are converted on a dedicated thread pool.
    /// `threads: None` uses one thread per CPU.
    Parallel { threads: Option<usize> },
}

/// Immutable configuration of one synchronization run.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Root of the compressed record files (`<source_root>/<category>/...`).
    pub source_root: PathBuf,
    /// Root of the derived columnar tree, mirroring the source partitioning.
    pub dest_root: PathBuf,
    /// SQLite file backing the processing ledger.
    pub ledger_path: PathBuf,
    /// Append-only log of failed conversion attempts.
    pub error_log: PathBuf,
    /// Process log written by the tracing file layer.
    pub process_log: PathBuf,
    /// Normalization rules file; a missing file means no normalization.
    pub normalization_path: PathBuf,
    /// Where the end-of-run JSON summary is written; `None` disables it.
    pub summary_path: Option<PathBuf>,
    /// Categories to process, in order.
    pub categories: Vec<EntityCategory>,
    /// Extension of source files, without the dot.
    pub source_extension: String,
    /// Extension of derived files, without the dot.
    pub output_extension: String,
    pub exec_mode: ExecMode,
    /// Per-file conversion deadline. `None` waits indefinitely.
    pub file_timeout: Option<Duration>,
    /// Run the orphan sweep after the conversion pass.
    pub reconcile_orphans: bool,
    /// Drop the ledger rows of sources whose orphaned output was removed.
    pub invalidate_orphan_ledger_rows: bool,
    /// Records sampled to enumerate columns; `None` scans the whole file.
    pub introspection_sample_rows: Option<usize>,
    /// Categories whose ledger rows are cleared before the pass.
    pub force_categories: Vec<EntityCategory>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_project_root(".")
    }
}

impl SyncConfig {
    /// Build the conventional layout under a project root:
    ///
    /// ```text
    /// <root>/data/source                      source records
    /// <root>/data/parquet                     derived files
    /// <root>/state/etl_state.db               ledger
    /// <root>/logs/etl_errors.log              error log
    /// <root>/logs/etl_process.log             process log
    /// <root>/logs/etl_stats.json              run summary
    /// <root>/config/schema_normalization.json normalization rules
    /// ```
    pub fn from_project_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            source_root: root.join("data").join("source"),
            dest_root: root.join("data").join("parquet"),
            ledger_path: root.join("state").join("etl_state.db"),
            error_log: root.join("logs").join("etl_errors.log"),
            process_log: root.join("logs").join("etl_process.log"),
            normalization_path: root.join("config").join("schema_normalization.json"),
            summary_path: Some(root.join("logs").join("etl_stats.json")),
            categories: EntityCategory::ALL.to_vec(),
            source_extension: "gz".to_string(),
            output_extension: "parquet".to_string(),
            exec_mode: ExecMode::Sequential,
            file_timeout: None,
            reconcile_orphans: true,
            invalidate_orphan_ledger_rows: true,
            introspection_sample_rows: None,
            force_categories: Vec::new(),
        }
    }

    /// The path mapping between the two trees described by this config.
    #[must_use]
    pub fn path_mapper(&self) -> PathMapper {
        PathMapper::new(
            &self.source_root,
            &self.dest_root,
            &self.source_extension,
            &self.output_extension,
        )
    }
}
