//! A conversion engine whose behaviour is chosen per file.

use crate::convert::ConversionEngine;
use crate::io::jsonl::{JsonlObjects, observed_columns};
use crate::normalization::Projection;
use anyhow::{Context, Result, anyhow, bail};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// What [`ScriptedConverter`] does for a matching source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Script {
    /// Count the records of the source and write a marker output.
    Count,
    /// Write a marker output and report this many records.
    Records(u64),
    /// Fail the conversion with this message.
    Fail(String),
    /// Fail column introspection, then convert like [`Script::Count`].
    FailIntrospection,
    /// Sleep, then convert like [`Script::Count`].
    Sleep(Duration),
}

/// One recorded `convert` call.
#[derive(Clone, Debug)]
pub struct ConvertCall {
    pub source: PathBuf,
    pub output: PathBuf,
    pub projection: Option<Projection>,
}

/// Test double for [`ConversionEngine`].
///
/// Scripts are matched by path suffix (`Path::ends_with`), first match wins;
/// unmatched sources use [`Script::Count`]. Outputs are small marker files,
/// not Parquet, which is enough for the engine and the orphan sweep.
#[derive(Debug, Default)]
pub struct ScriptedConverter {
    scripts: Mutex<Vec<(PathBuf, Script)>>,
    calls: Mutex<Vec<ConvertCall>>,
}

impl ScriptedConverter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `script` to sources whose path ends with `suffix`.
    #[must_use]
    pub fn on(self, suffix: impl Into<PathBuf>, script: Script) -> Self {
        self.set(suffix, script);
        self
    }

    /// Replace (or add) the script of `suffix` on a shared converter.
    pub fn set(&self, suffix: impl Into<PathBuf>, script: Script) {
        let suffix = suffix.into();
        let mut scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        scripts.retain(|(s, _)| *s != suffix);
        scripts.push((suffix, script));
    }

    /// Every `convert` call so far, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<ConvertCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sources passed to `convert`, in call order.
    #[must_use]
    pub fn converted(&self) -> Vec<PathBuf> {
        self.calls().into_iter().map(|c| c.source).collect()
    }

    fn script_for(&self, source: &Path) -> Script {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(suffix, _)| source.ends_with(suffix))
            .map_or(Script::Count, |(_, s)| s.clone())
    }
}

fn count_records(source: &Path) -> Result<u64> {
    let mut n = 0;
    for record in JsonlObjects::open(source)? {
        record?;
        n += 1;
    }
    Ok(n)
}

fn write_marker(output: &Path, records: u64) -> Result<()> {
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
    }
    fs::write(output, format!("records={records}\n"))
        .with_context(|| format!("write {}", output.display()))
}

impl ConversionEngine for ScriptedConverter {
    fn describe_columns(&self, source: &Path) -> Result<Vec<String>> {
        match self.script_for(source) {
            Script::FailIntrospection => Err(anyhow!("cannot enumerate columns of {}", source.display())),
            _ => observed_columns(source, None),
        }
    }

    fn convert(
        &self,
        source: &Path,
        output: &Path,
        projection: Option<&Projection>,
    ) -> Result<u64> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ConvertCall {
                source: source.to_path_buf(),
                output: output.to_path_buf(),
                projection: projection.cloned(),
            });

        let records = match self.script_for(source) {
            Script::Fail(message) => bail!("{message}"),
            Script::Records(n) => n,
            Script::Sleep(d) => {
                thread::sleep(d);
                count_records(source)?
            }
            Script::Count | Script::FailIntrospection => count_records(source)?,
        };
        write_marker(output, records)?;
        Ok(records)
    }
}
