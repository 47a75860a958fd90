//! Streaming reader for line-delimited JSON records.
//!
//! Source partitions hold one JSON object per line, usually gzip-compressed.
//! [`JsonlObjects`] streams them without materializing the file;
//! [`observed_columns`] enumerates the top-level keys, which is the schema
//! introspection step of the conversion.
//!
//! # Notes
//! - Empty/whitespace-only lines are skipped.
//! - A line that is not a JSON *object* is an error carrying its line number.
//! - Decompression is transparent (see [`crate::io::compression`]).

use crate::io::compression::auto_detect_reader;
use anyhow::{Context, Result, bail};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

/// One decoded record: its top-level fields in file order.
pub type Record = Map<String, Value>;

/// Iterator over the JSON objects of a JSONL file.
pub struct JsonlObjects {
    path: PathBuf,
    reader: BufReader<Box<dyn Read>>,
    line: String,
    line_no: usize,
}

impl JsonlObjects {
    /// Open `path`, detecting compression from extension or magic bytes.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or the decoder cannot be
    /// initialised.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let f = File::open(&path).with_context(|| format!("open {}", path.display()))?;
        let rdr = auto_detect_reader(f, &path)
            .with_context(|| format!("setup decompression for {}", path.display()))?;
        Ok(Self {
            path,
            reader: BufReader::new(rdr),
            line: String::new(),
            line_no: 0,
        })
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            self.line.clear();
            let n = self
                .reader
                .read_line(&mut self.line)
                .with_context(|| format!("read line {} in {}", self.line_no + 1, self.path.display()))?;
            if n == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(trimmed).with_context(|| {
                format!("parse JSONL line {} in {}", self.line_no, self.path.display())
            })?;
            return match value {
                Value::Object(map) => Ok(Some(map)),
                other => bail!(
                    "line {} in {} is a JSON {}, expected an object",
                    self.line_no,
                    self.path.display(),
                    kind_of(&other)
                ),
            };
        }
    }
}

impl Iterator for JsonlObjects {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Top-level column names of a JSONL file, in order of first appearance.
///
/// Only the first `sample_rows` records are inspected when given; `None`
/// scans the whole file.
///
/// # Errors
/// Returns an error if the file cannot be read, a sampled line is not a JSON
/// object, or no column is found at all.
pub fn observed_columns(path: impl AsRef<Path>, sample_rows: Option<usize>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let mut seen = HashSet::new();
    let mut columns = Vec::new();
    let limit = sample_rows.unwrap_or(usize::MAX);

    for record in JsonlObjects::open(path)?.take(limit) {
        for key in record?.keys() {
            if seen.insert(key.clone()) {
                columns.push(key.clone());
            }
        }
    }

    if columns.is_empty() {
        bail!("no columns found in {}", path.display());
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(tmp: &TempDir, name: &str, body: &str) -> PathBuf {
        let p = tmp.path().join(name);
        fs::write(&p, body).unwrap();
        p
    }

    #[test]
    fn streams_objects_and_skips_blank_lines() {
        let tmp = TempDir::new().unwrap();
        let p = write(&tmp, "a.jsonl", "{\"id\":1}\n\n   \n{\"id\":2}\n");
        let ids: Vec<i64> = JsonlObjects::open(&p)
            .unwrap()
            .map(|r| r.unwrap()["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn non_object_line_reports_line_number() {
        let tmp = TempDir::new().unwrap();
        let p = write(&tmp, "a.jsonl", "{\"id\":1}\n[1,2]\n");
        let err = JsonlObjects::open(&p)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap_err();
        assert!(err.to_string().contains("line 2"), "{err}");
    }

    #[test]
    fn malformed_json_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let p = write(&tmp, "a.jsonl", "{\"id\":1}\n{\"id\":\n");
        assert!(
            JsonlObjects::open(&p)
                .unwrap()
                .collect::<Result<Vec<_>>>()
                .is_err()
        );
    }

    #[test]
    fn columns_in_first_appearance_order() {
        let tmp = TempDir::new().unwrap();
        let p = write(
            &tmp,
            "a.jsonl",
            "{\"id\":1,\"type\":\"x\"}\n{\"year\":2020,\"id\":2}\n{\"abstract\":null}\n",
        );
        assert_eq!(
            observed_columns(&p, None).unwrap(),
            vec!["id", "type", "year", "abstract"]
        );
        assert_eq!(observed_columns(&p, Some(1)).unwrap(), vec!["id", "type"]);
    }

    #[test]
    fn empty_file_has_no_columns() {
        let tmp = TempDir::new().unwrap();
        let p = write(&tmp, "empty.jsonl", "\n");
        assert!(observed_columns(&p, None).is_err());
    }
}
