//! Source trees and project layouts on disk.

use crate::config::SyncConfig;
use crate::io::compression::auto_detect_writer;
use anyhow::{Context, Result};
use serde_json::Value;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Write `records` as JSON lines to `path`, compressed according to its
/// extension (`.gz` → gzip, `.zst` → zstd, otherwise plain).
///
/// # Errors
/// Returns an error if the file cannot be created or written.
pub fn write_jsonl(path: &Path, records: &[Value]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut w = auto_detect_writer(file, path)?;
    for record in records {
        serde_json::to_writer(&mut w, record).context("serialize record")?;
        w.write_all(b"\n").context("write newline")?;
    }
    w.flush().context("flush")?;
    Ok(())
}

/// Builds files below a source root.
///
/// ```
/// use openalex_sync::testing::SourceTreeBuilder;
/// use serde_json::json;
///
/// let dir = tempfile::tempdir()?;
/// let tree = SourceTreeBuilder::new(dir.path());
/// let path = tree.records("authors/part_0.gz", &[json!({"id": "A1"})])?;
/// assert!(path.exists());
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct SourceTreeBuilder {
    root: PathBuf,
}

impl SourceTreeBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of `rel` below the root.
    #[must_use]
    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Write a JSONL file of `records` at `rel`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn records(&self, rel: &str, records: &[Value]) -> Result<PathBuf> {
        let path = self.path(rel);
        write_jsonl(&path, records)?;
        Ok(path)
    }

    /// Write raw bytes at `rel`, uncompressed.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn bytes(&self, rel: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Delete the file at `rel`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be removed.
    pub fn remove(&self, rel: &str) -> Result<()> {
        let path = self.path(rel);
        fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))
    }
}

/// A throwaway project directory with the conventional layout.
///
/// The directory is deleted on drop.
pub struct TestProject {
    dir: TempDir,
    pub config: SyncConfig,
}

impl TestProject {
    /// # Errors
    /// Returns an error if the temporary directory cannot be created.
    pub fn new() -> Result<Self> {
        let dir = TempDir::new().context("create temporary project")?;
        let config = SyncConfig::from_project_root(dir.path());
        Ok(Self { dir, config })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Builder over the configured source root.
    #[must_use]
    pub fn source(&self) -> SourceTreeBuilder {
        SourceTreeBuilder::new(&self.config.source_root)
    }

    /// `<dest_root>/<rel>`
    #[must_use]
    pub fn dest(&self, rel: &str) -> PathBuf {
        self.config.dest_root.join(rel)
    }

    /// Write the normalization rules file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn normalization(&self, rules: &Value) -> Result<PathBuf> {
        let path = self.config.normalization_path.clone();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_vec_pretty(rules)?)
            .with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}
