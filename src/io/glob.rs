//! File globbing for partitioned trees.
//!
//! Both the discovery pass (`<source_root>/<category>/**/*.gz`) and the orphan
//! sweep (`<dest_root>/<category>/**/*.parquet`) enumerate files the same
//! way: recursive glob, files only, hidden entries skipped, sorted for a
//! deterministic processing order.

use anyhow::{Context, Result, bail};
use glob::{MatchOptions, Pattern, glob_with};
use std::path::{Path, PathBuf};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    // Skips in-flight `.tmp` outputs and other dotfiles.
    require_literal_leading_dot: true,
};

/// Expand a glob pattern into a sorted vector of matching files.
///
/// Directories are never returned. No match yields an empty vector.
///
/// ```no_run
/// use openalex_sync::io::glob::expand_glob;
///
/// let files = expand_glob("data/source/works/updated_date=*/*.gz")?;
/// # use anyhow::Error; Ok::<(), Error>(())
/// ```
///
/// # Errors
/// Returns an error if the pattern is invalid or a directory entry cannot be
/// read while walking.
pub fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>> {
    let paths =
        glob_with(pattern, MATCH_OPTIONS).with_context(|| format!("invalid glob pattern: {pattern}"))?;

    let mut result = Vec::new();
    for entry in paths {
        let path =
            entry.with_context(|| format!("error reading glob entry for pattern: {pattern}"))?;
        if path.is_file() {
            result.push(path);
        }
    }

    result.sort();
    Ok(result)
}

/// Every file below `root` (at any depth) whose final extension is `ext`.
///
/// `root` is escaped, so partition directories such as `updated_date=[x]`
/// or paths containing `*` are taken literally. A missing `root` yields an
/// empty vector.
///
/// # Errors
/// Returns an error if `root` is not valid UTF-8 or the walk fails.
pub fn files_with_extension(root: &Path, ext: &str) -> Result<Vec<PathBuf>> {
    let Some(root_str) = root.to_str() else {
        bail!("path is not valid UTF-8: {}", root.display());
    };
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let ext = ext.trim_start_matches('.');
    let pattern = format!(
        "{}/**/*.{}",
        Pattern::escape(root_str.trim_end_matches('/')),
        Pattern::escape(ext)
    );
    expand_glob(&pattern)
}
