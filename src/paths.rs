//! Mapping between the source tree and the derived tree.
//!
//! ```text
//! <source_root>/works/updated_date=2025-10-16/part_0000.gz
//!   <->
//! <dest_root>/works/updated_date=2025-10-16/part_0000.parquet
//! ```
//!
//! Only the root prefix and the final extension change; every partition
//! directory segment is kept verbatim. Both directions are checked, which
//! makes the mapping a bijection between `*.<source_ext>` files under the
//! source root and `*.<output_ext>` files under the destination root.

use crate::category::EntityCategory;
use crate::error::SyncError;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Bidirectional path mapping used by the sync pass and by reconciliation.
#[derive(Clone, Debug)]
pub struct PathMapper {
    source_root: PathBuf,
    dest_root: PathBuf,
    source_ext: String,
    output_ext: String,
}

impl PathMapper {
    /// Roots are made absolute (without touching the filesystem) so ledger
    /// keys do not depend on the working directory.
    pub fn new(
        source_root: impl AsRef<Path>,
        dest_root: impl AsRef<Path>,
        source_ext: &str,
        output_ext: &str,
    ) -> Self {
        Self {
            source_root: absolute(source_root.as_ref()),
            dest_root: absolute(dest_root.as_ref()),
            source_ext: source_ext.trim_start_matches('.').to_string(),
            output_ext: output_ext.trim_start_matches('.').to_string(),
        }
    }

    #[must_use]
    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    #[must_use]
    pub fn dest_root(&self) -> &Path {
        &self.dest_root
    }

    #[must_use]
    pub fn source_extension(&self) -> &str {
        &self.source_ext
    }

    #[must_use]
    pub fn output_extension(&self) -> &str {
        &self.output_ext
    }

    /// Derived file path for a source file.
    ///
    /// # Errors
    /// Fails if `source` is not under the source root or does not carry the
    /// source extension.
    pub fn output_for(&self, source: &Path) -> Result<PathBuf, SyncError> {
        let rel = relative_to(source, &self.source_root)?;
        check_extension(source, &self.source_ext)?;
        Ok(self.dest_root.join(rel).with_extension(&self.output_ext))
    }

    /// Source file path a derived file was produced from.
    ///
    /// # Errors
    /// Fails if `output` is not under the destination root or does not carry
    /// the output extension.
    pub fn source_for(&self, output: &Path) -> Result<PathBuf, SyncError> {
        let rel = relative_to(output, &self.dest_root)?;
        check_extension(output, &self.output_ext)?;
        Ok(self.source_root.join(rel).with_extension(&self.source_ext))
    }

    /// `<source_root>/<category>`
    #[must_use]
    pub fn source_dir(&self, category: EntityCategory) -> PathBuf {
        self.source_root.join(category.as_str())
    }

    /// `<dest_root>/<category>`
    #[must_use]
    pub fn dest_dir(&self, category: EntityCategory) -> PathBuf {
        self.dest_root.join(category.as_str())
    }
}

fn absolute(p: &Path) -> PathBuf {
    std::path::absolute(p).unwrap_or_else(|_| p.to_path_buf())
}

fn relative_to(path: &Path, root: &Path) -> Result<PathBuf, SyncError> {
    let path_abs = absolute(path);
    match path_abs.strip_prefix(root) {
        Ok(rel) if rel.file_name().is_some() => Ok(rel.to_path_buf()),
        _ => Err(SyncError::OutsideRoot {
            path: path.to_path_buf(),
            root: root.to_path_buf(),
        }),
    }
}

fn check_extension(path: &Path, expected: &str) -> Result<(), SyncError> {
    if path.extension() == Some(OsStr::new(expected)) {
        Ok(())
    } else {
        Err(SyncError::ForeignExtension {
            path: path.to_path_buf(),
            expected: expected.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> PathMapper {
        PathMapper::new("/data/source", "/data/parquet", "gz", "parquet")
    }

    #[test]
    fn maps_source_to_output_preserving_partitions() {
        let m = mapper();
        let out = m
            .output_for(Path::new(
                "/data/source/works/updated_date=2025-10-16/part_0000.gz",
            ))
            .unwrap();
        assert_eq!(
            out,
            PathBuf::from("/data/parquet/works/updated_date=2025-10-16/part_0000.parquet")
        );
    }

    #[test]
    fn mapping_is_reversible() {
        let m = mapper();
        let src = PathBuf::from("/data/source/authors/updated_date=2024-01-01/part_007.gz");
        let out = m.output_for(&src).unwrap();
        assert_eq!(m.source_for(&out).unwrap(), src);
    }

    #[test]
    fn only_the_final_extension_is_swapped() {
        let m = mapper();
        let src = PathBuf::from("/data/source/works/x.gz.d/part.json.gz");
        let out = m.output_for(&src).unwrap();
        assert_eq!(out, PathBuf::from("/data/parquet/works/x.gz.d/part.json.parquet"));
        assert_eq!(m.source_for(&out).unwrap(), src);
    }

    #[test]
    fn rejects_paths_outside_root() {
        let m = mapper();
        assert!(matches!(
            m.output_for(Path::new("/elsewhere/works/part_0.gz")),
            Err(SyncError::OutsideRoot { .. })
        ));
        assert!(matches!(
            m.source_for(Path::new("/data/source/works/part_0.parquet")),
            Err(SyncError::OutsideRoot { .. })
        ));
    }

    #[test]
    fn rejects_foreign_extensions() {
        let m = mapper();
        assert!(matches!(
            m.output_for(Path::new("/data/source/works/part_0.json")),
            Err(SyncError::ForeignExtension { .. })
        ));
        assert!(matches!(
            m.source_for(Path::new("/data/parquet/works/.part_0.tmp")),
            Err(SyncError::ForeignExtension { .. })
        ));
    }
}
