//! Typed failures that callers need to tell apart.
//!
//! Most of the crate propagates `anyhow::Error` with context. The variants
//! here are the ones the sync loop branches on: ledger failures abort the
//! run, everything else is confined to a single file or rejected at load
//! time.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Domain errors of the synchronization pipeline.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The processing ledger could not be read or written. Fatal for the run.
    #[error("ledger error: {0}")]
    Ledger(#[from] rusqlite::Error),

    /// Another thread panicked while holding the ledger connection.
    #[error("ledger connection lock poisoned")]
    LedgerPoisoned,

    /// A category name outside the closed set.
    #[error("unknown entity category '{name}' (expected one of: {expected})")]
    UnknownCategory { name: String, expected: String },

    /// A column listed in both normalization rule sets of one category.
    #[error(
        "column '{column}' of category '{category}' is listed in both toText and toSerializedText"
    )]
    ConflictingRule { category: String, column: String },

    /// A path that is not located under the tree it is mapped from.
    #[error("{} is not under {}", path.display(), root.display())]
    OutsideRoot { path: PathBuf, root: PathBuf },

    /// A path whose final extension is not the one the mapping expects.
    #[error("{} does not have the .{expected} extension", path.display())]
    ForeignExtension { path: PathBuf, expected: String },

    /// A conversion did not finish within the per-file deadline.
    #[error("conversion of {} timed out after {after:?}", path.display())]
    Timeout { path: PathBuf, after: Duration },

    /// A discovered source file disappeared before it could be fingerprinted.
    #[error("source {} vanished before processing", path.display())]
    Vanished { path: PathBuf },
}
