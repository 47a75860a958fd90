//! Orphan reconciliation between the derived tree and the source tree.
//!
//! The conversion pass only adds and replaces derived files. When the
//! upstream producer deletes a source partition, its derived file stays
//! behind; this sweep finds such orphans by mapping every derived file back
//! to its source path and removes those whose source is gone.
//!
//! The sweep is filesystem-only. It never reads or writes the ledger; the
//! sync engine decides what to do with [`ReconcileStats::removed_sources`].

use crate::category::EntityCategory;
use crate::io::glob::files_with_extension;
use crate::paths::PathMapper;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

/// Whether orphans are deleted or only counted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ReconcileMode {
    #[default]
    Delete,
    DryRun,
}

/// Counters of one sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    /// Derived files inspected.
    pub scanned: u64,
    /// Derived files whose source exists.
    pub kept: u64,
    /// Orphans removed (or, in dry-run mode, that would be removed).
    pub removed: u64,
    /// Deletion or listing failures.
    pub errors: u64,
    /// Source paths of the removed orphans.
    pub removed_sources: Vec<PathBuf>,
}

/// Sweep `<dest_root>/<category>` for every category.
///
/// Failures to list a directory or delete a file are counted in
/// [`ReconcileStats::errors`] and never stop the sweep.
#[must_use]
pub fn reconcile(
    mapper: &PathMapper,
    categories: &[EntityCategory],
    mode: ReconcileMode,
) -> ReconcileStats {
    let mut stats = ReconcileStats::default();
    for &category in categories {
        let dir = mapper.dest_dir(category);
        let outputs = match files_with_extension(&dir, mapper.output_extension()) {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!(%category, dir = %dir.display(), error = %e, "cannot list derived files");
                stats.errors += 1;
                continue;
            }
        };

        for output in outputs {
            stats.scanned += 1;
            let source = match mapper.source_for(&output) {
                Ok(source) => source,
                Err(e) => {
                    warn!(path = %output.display(), error = %e, "cannot map derived file");
                    stats.errors += 1;
                    continue;
                }
            };
            if source.exists() {
                stats.kept += 1;
                continue;
            }
            match mode {
                ReconcileMode::DryRun => {
                    info!(path = %output.display(), "orphan (dry run)");
                    stats.removed += 1;
                    stats.removed_sources.push(source);
                }
                ReconcileMode::Delete => match fs::remove_file(&output) {
                    Ok(()) => {
                        info!(path = %output.display(), "removed orphan");
                        stats.removed += 1;
                        stats.removed_sources.push(source);
                    }
                    Err(e) => {
                        warn!(path = %output.display(), error = %e, "failed to remove orphan");
                        stats.errors += 1;
                    }
                },
            }
        }
    }
    info!(
        scanned = stats.scanned,
        kept = stats.kept,
        removed = stats.removed,
        errors = stats.errors,
        "orphan reconciliation finished"
    );
    stats
}

/// Consistency of one category.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CategoryIntegrity {
    pub category: EntityCategory,
    pub sources: u64,
    pub outputs: u64,
    /// Derived files without a source.
    pub orphans: Vec<PathBuf>,
    /// Sources without a derived file.
    pub missing_outputs: Vec<PathBuf>,
}

/// Read-only comparison of the two trees.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub categories: Vec<CategoryIntegrity>,
}

impl IntegrityReport {
    #[must_use]
    pub fn total_orphans(&self) -> usize {
        self.categories.iter().map(|c| c.orphans.len()).sum()
    }

    #[must_use]
    pub fn total_missing(&self) -> usize {
        self.categories.iter().map(|c| c.missing_outputs.len()).sum()
    }

    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.total_orphans() == 0 && self.total_missing() == 0
    }
}

/// Compare source and derived trees without changing either.
///
/// # Errors
/// Returns an error if a directory cannot be walked.
pub fn integrity_report(
    mapper: &PathMapper,
    categories: &[EntityCategory],
) -> anyhow::Result<IntegrityReport> {
    let mut report = IntegrityReport::default();
    for &category in categories {
        let sources = files_with_extension(&mapper.source_dir(category), mapper.source_extension())?;
        let outputs = files_with_extension(&mapper.dest_dir(category), mapper.output_extension())?;

        let missing_outputs = sources
            .iter()
            .filter(|s| mapper.output_for(s).map_or(true, |o| !o.exists()))
            .cloned()
            .collect();
        let orphans = outputs
            .iter()
            .filter(|o| mapper.source_for(o).map_or(true, |s| !s.exists()))
            .cloned()
            .collect();

        report.categories.push(CategoryIntegrity {
            category,
            sources: sources.len() as u64,
            outputs: outputs.len() as u64,
            orphans,
            missing_outputs,
        });
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn touch(p: &Path) {
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, b"x").unwrap();
    }

    #[test]
    fn dry_run_deletes_nothing() {
        let tmp = TempDir::new().unwrap();
        let mapper = PathMapper::new(tmp.path().join("s"), tmp.path().join("d"), "gz", "parquet");
        let orphan = tmp.path().join("d/works/x=1/part_0.parquet");
        touch(&orphan);
        let stats = reconcile(&mapper, &[EntityCategory::Works], ReconcileMode::DryRun);
        assert_eq!(stats.removed, 1);
        assert_eq!(
            stats.removed_sources,
            vec![tmp.path().join("s/works/x=1/part_0.gz")]
        );
        assert!(orphan.exists());
    }

    #[test]
    fn integrity_report_lists_both_directions() {
        let tmp = TempDir::new().unwrap();
        let mapper = PathMapper::new(tmp.path().join("s"), tmp.path().join("d"), "gz", "parquet");
        touch(&tmp.path().join("s/authors/part_0.gz"));
        touch(&tmp.path().join("s/authors/part_1.gz"));
        touch(&tmp.path().join("d/authors/part_0.parquet"));
        touch(&tmp.path().join("d/authors/part_9.parquet"));

        let report = integrity_report(&mapper, &[EntityCategory::Authors]).unwrap();
        let c = &report.categories[0];
        assert_eq!((c.sources, c.outputs), (2, 2));
        assert_eq!(c.missing_outputs, vec![tmp.path().join("s/authors/part_1.gz")]);
        assert_eq!(c.orphans, vec![tmp.path().join("d/authors/part_9.parquet")]);
        assert!(!report.is_consistent());
    }
}
