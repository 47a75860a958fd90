//! # openalex-sync
//!
//! Incremental, resumable conversion of a growing tree of compressed JSONL
//! record files into a mirrored tree of Parquet files.
//!
//! A run is idempotent: a file is converted only when its content
//! fingerprint differs from the one recorded in the processing ledger, a
//! failed conversion never leaves a partial output behind, and derived files
//! whose source was deleted upstream are swept away afterwards.
//!
//! ## Pipeline
//!
//! ```text
//! discover ─▶ fingerprint ─▶ ledger skip-check ─▶ normalize? ─▶ convert ─▶ record outcome
//!                                                                              │
//!                                               orphan reconciliation ◀────────┘
//!                                                        │
//!                                                   run summary
//! ```
//!
//! ## Core types
//!
//! - [`SyncConfig`]: immutable configuration, built once.
//! - [`SyncEngine`]: runs the pass and returns a [`RunReport`].
//! - [`ProcessingLedger`]: SQLite record of processed and failed files.
//! - [`NormalizationPolicy`]: per-category column coercion rules and the
//!   [`Projection`] built from them.
//! - [`ConversionEngine`]: the conversion seam; [`ArrowConverter`] writes
//!   ZSTD-compressed Parquet through Arrow.
//!
//! ## Quick start
//!
//! ```no_run
//! use openalex_sync::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = SyncConfig::from_project_root("/srv/openalex");
//! let ledger = ProcessingLedger::open(&config.ledger_path)?;
//! let policy = NormalizationPolicy::load(&config.normalization_path)?;
//! let converter = ArrowConverter::new().with_sample_rows(config.introspection_sample_rows);
//!
//! let engine = SyncEngine::new(config, ledger, policy, converter);
//! let report = engine.run()?;
//! std::process::exit(report.exit_code());
//! # }
//! ```
//!
//! ## Feature flags
//!
//! - `compression-gzip` (default): read `.gz` sources.
//! - `compression-zstd` (default): read `.zst` sources.

pub mod category;
pub mod config;
pub mod convert;
pub mod discovery;
pub mod error;
pub mod hasher;
pub mod io;
pub mod ledger;
pub mod logging;
pub mod normalization;
pub mod paths;
pub mod reconcile;
pub mod report;
pub mod sync;
pub mod testing;

pub use category::EntityCategory;
pub use config::{ExecMode, SyncConfig};
pub use convert::{ArrowConverter, ConversionEngine};
pub use discovery::{CategoryFiles, SourceFile, discover};
pub use error::SyncError;
pub use hasher::{Fingerprint, fingerprint};
pub use ledger::{CategoryStats, FailureEntry, LedgerEntry, LedgerStats, ProcessingLedger};
pub use normalization::{
    NormalizationPolicy, NormalizationRules, ProjectedColumn, Projection, Transform,
};
pub use paths::PathMapper;
pub use reconcile::{
    CategoryIntegrity, IntegrityReport, ReconcileMode, ReconcileStats, integrity_report, reconcile,
};
pub use report::{ErrorLog, RunSummary};
pub use sync::{CategoryRunStats, FileOutcome, RunReport, RunStats, SyncEngine};
