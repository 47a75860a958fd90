//! Enumeration of source files.

use crate::category::EntityCategory;
use crate::io::glob::files_with_extension;
use crate::paths::PathMapper;
use anyhow::Result;
use std::path::PathBuf;
use tracing::{debug, info};

/// A source file as seen at discovery time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub category: EntityCategory,
    /// Size at discovery; the sync pass re-reads it before fingerprinting.
    pub size: u64,
}

/// Files of one category, in processing order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CategoryFiles {
    pub category: EntityCategory,
    pub files: Vec<SourceFile>,
}

/// Enumerate `<source_root>/<category>/**/*.<source_ext>` for each category,
/// in the order given. Paths within a category are sorted. A category whose
/// directory does not exist yields an empty group.
///
/// A file deleted between listing and `stat` is dropped here; deletions after
/// discovery are handled by the sync pass.
///
/// # Errors
/// Returns an error if a directory cannot be walked.
pub fn discover(mapper: &PathMapper, categories: &[EntityCategory]) -> Result<Vec<CategoryFiles>> {
    let mut groups = Vec::with_capacity(categories.len());
    for &category in categories {
        let dir = mapper.source_dir(category);
        let paths = files_with_extension(&dir, mapper.source_extension())?;
        let files: Vec<_> = paths
            .into_iter()
            .filter_map(|path| {
                let size = std::fs::metadata(&path).ok()?.len();
                Some(SourceFile {
                    path,
                    category,
                    size,
                })
            })
            .collect();
        if files.is_empty() {
            debug!(%category, dir = %dir.display(), "no source files");
        } else {
            info!(%category, files = files.len(), "discovered source files");
        }
        groups.push(CategoryFiles { category, files });
    }
    Ok(groups)
}
