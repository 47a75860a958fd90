//! The conversion engine: one compressed JSONL file in, one Parquet file out.
//!
//! [`ConversionEngine`] is the seam the sync loop talks to. [`ArrowConverter`]
//! is the production implementation; tests substitute
//! [`crate::testing::ScriptedConverter`].
//!
//! The Arrow path reads the source twice. Pass 1 applies the projection to
//! every record and infers an Arrow schema from the result; pass 2 decodes
//! the same projected records into batches against that schema and streams
//! them into a [`ParquetSink`]. Nothing is visible at the output path until
//! the sink is finished.

use crate::io::jsonl::{JsonlObjects, Record, observed_columns};
use crate::io::parquet::ParquetSink;
use crate::normalization::{Projection, Transform};
use anyhow::{Context, Result};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::json::ReaderBuilder;
use arrow::json::reader::infer_json_schema_from_iterator;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Converts one source file into one columnar file.
pub trait ConversionEngine: Send + Sync {
    /// Top-level column names of `source`, in order of first appearance.
    ///
    /// # Errors
    /// Any error here is treated by the caller as an introspection failure
    /// and the file is converted without normalization.
    fn describe_columns(&self, source: &Path) -> Result<Vec<String>>;

    /// Convert `source` into `output`, applying `projection` when given.
    /// Returns the number of records written.
    ///
    /// # Errors
    /// Returns an error if the source cannot be read or decoded or the output
    /// cannot be written. The output path is untouched on error.
    fn convert(&self, source: &Path, output: &Path, projection: Option<&Projection>)
    -> Result<u64>;
}

impl<T: ConversionEngine + ?Sized> ConversionEngine for Arc<T> {
    fn describe_columns(&self, source: &Path) -> Result<Vec<String>> {
        (**self).describe_columns(source)
    }

    fn convert(
        &self,
        source: &Path,
        output: &Path,
        projection: Option<&Projection>,
    ) -> Result<u64> {
        (**self).convert(source, output, projection)
    }
}

const DEFAULT_BATCH_SIZE: usize = 8192;

/// JSONL (optionally compressed) to ZSTD Parquet through Arrow.
#[derive(Clone, Debug)]
pub struct ArrowConverter {
    sample_rows: Option<usize>,
    batch_size: usize,
}

impl Default for ArrowConverter {
    fn default() -> Self {
        Self {
            sample_rows: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl ArrowConverter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit column introspection to the first `rows` records.
    #[must_use]
    pub const fn with_sample_rows(mut self, rows: Option<usize>) -> Self {
        self.sample_rows = rows;
        self
    }

    /// Records per Arrow batch (and thus per Parquet write call).
    #[must_use]
    pub const fn with_batch_size(mut self, rows: usize) -> Self {
        self.batch_size = if rows == 0 { 1 } else { rows };
        self
    }

    fn infer_schema(&self, source: &Path, shaper: &RecordShaper) -> Result<SchemaRef> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let values = JsonlObjects::open(source)?.map(|r| -> Result<Value, ArrowError> {
            let record = shaper.shape(r.map_err(|e| ArrowError::ExternalError(e.into()))?);
            for key in record.keys() {
                if seen.insert(key.clone()) {
                    order.push(key.clone());
                }
            }
            Ok(Value::Object(record))
        });
        let inferred = infer_json_schema_from_iterator(values)
            .with_context(|| format!("infer schema of {}", source.display()))?;

        // Fix the column order to the shaped record order regardless of how
        // inference keys its fields. Coerced columns are text even when every
        // value in this file is null.
        let fields: Vec<_> = order
            .iter()
            .filter_map(|name| {
                if shaper.yields_text(name) {
                    Some(Field::new(name.as_str(), DataType::Utf8, true))
                } else {
                    inferred.field_with_name(name).ok().cloned()
                }
            })
            .collect();
        Ok(Arc::new(Schema::new(fields)))
    }
}

impl ConversionEngine for ArrowConverter {
    fn describe_columns(&self, source: &Path) -> Result<Vec<String>> {
        observed_columns(source, self.sample_rows)
    }

    fn convert(
        &self,
        source: &Path,
        output: &Path,
        projection: Option<&Projection>,
    ) -> Result<u64> {
        let shaper = RecordShaper::new(projection);
        let schema = self.infer_schema(source, &shaper)?;
        debug!(
            source = %source.display(),
            columns = schema.fields().len(),
            "inferred schema"
        );

        let mut decoder = ReaderBuilder::new(schema.clone())
            .with_batch_size(self.batch_size)
            .with_coerce_primitive(true)
            .build_decoder()
            .context("build JSON decoder")?;
        let mut sink = ParquetSink::create(output, schema)?;

        let mut chunk: Vec<Record> = Vec::with_capacity(self.batch_size);
        for record in JsonlObjects::open(source)? {
            chunk.push(shaper.shape(record?));
            if chunk.len() >= self.batch_size {
                decoder
                    .serialize(&chunk)
                    .with_context(|| format!("decode records of {}", source.display()))?;
                chunk.clear();
                if let Some(batch) = decoder.flush().context("flush JSON decoder")? {
                    sink.write(&batch)?;
                }
            }
        }
        if !chunk.is_empty() {
            decoder
                .serialize(&chunk)
                .with_context(|| format!("decode records of {}", source.display()))?;
        }
        if let Some(batch) = decoder.flush().context("flush JSON decoder")? {
            sink.write(&batch)?;
        }

        sink.finish()
    }
}

/// Applies a projection to individual records.
///
/// Projected columns come first, in projection order, with their transform
/// applied. Columns the projection does not know (first seen past the
/// introspection sample) follow unchanged in record order.
struct RecordShaper {
    slots: HashMap<String, (usize, Transform)>,
    width: usize,
    active: bool,
}

impl RecordShaper {
    fn new(projection: Option<&Projection>) -> Self {
        let slots: HashMap<_, _> = projection
            .map(|p| {
                p.columns()
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (c.name.clone(), (i, c.transform)))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            width: slots.len(),
            active: projection.is_some(),
            slots,
        }
    }

    fn yields_text(&self, name: &str) -> bool {
        self.slots
            .get(name)
            .is_some_and(|&(_, t)| t != Transform::Identity)
    }

    fn shape(&self, record: Record) -> Record {
        if !self.active {
            return record;
        }
        let mut placed: Vec<Option<(String, Value)>> = vec![None; self.width];
        let mut extra = Vec::new();
        for (name, value) in record {
            match self.slots.get(&name) {
                Some(&(i, transform)) => placed[i] = Some((name, apply(transform, value))),
                None => extra.push((name, value)),
            }
        }
        let mut out = Map::with_capacity(placed.len() + extra.len());
        out.extend(placed.into_iter().flatten());
        out.extend(extra);
        out
    }
}

/// Apply one column transform to one value. Nulls stay null.
fn apply(transform: Transform, value: Value) -> Value {
    match (transform, value) {
        (_, Value::Null) => Value::Null,
        (Transform::Identity, v) | (Transform::CastToText, v @ Value::String(_)) => v,
        (Transform::CastToText | Transform::SerializeToText, v) => Value::String(v.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::EntityCategory;
    use crate::normalization::{NormalizationPolicy, NormalizationRules};
    use serde_json::json;

    fn projection(to_text: &[&str], to_json: &[&str], observed: &[&str]) -> Projection {
        let rules = NormalizationRules {
            to_text: to_text.iter().map(ToString::to_string).collect(),
            to_serialized_text: to_json.iter().map(ToString::to_string).collect(),
        };
        NormalizationPolicy::from_rules([(EntityCategory::Works, rules)])
            .unwrap()
            .build_projection(EntityCategory::Works, observed)
    }

    fn obj(v: Value) -> Record {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn transforms_keep_nulls() {
        assert_eq!(apply(Transform::CastToText, Value::Null), Value::Null);
        assert_eq!(apply(Transform::SerializeToText, Value::Null), Value::Null);
    }

    #[test]
    fn cast_to_text_keeps_strings_verbatim() {
        assert_eq!(apply(Transform::CastToText, json!("a\"b")), json!("a\"b"));
        assert_eq!(apply(Transform::CastToText, json!(12)), json!("12"));
        assert_eq!(apply(Transform::CastToText, json!({"k": 1})), json!("{\"k\":1}"));
    }

    #[test]
    fn serialize_to_text_quotes_strings() {
        assert_eq!(apply(Transform::SerializeToText, json!("x")), json!("\"x\""));
        assert_eq!(
            apply(Transform::SerializeToText, json!({"a": [1, 2]})),
            json!("{\"a\":[1,2]}")
        );
    }

    #[test]
    fn shaper_orders_projected_then_unknown() {
        let p = projection(&["type"], &["aii"], &["id", "type", "aii"]);
        let shaper = RecordShaper::new(Some(&p));
        let out = shaper.shape(obj(json!({"late": 1, "aii": {"w": [0]}, "id": 7, "type": 3})));
        let keys: Vec<_> = out.keys().cloned().collect();
        assert_eq!(keys, vec!["id", "type", "aii", "late"]);
        assert_eq!(out["type"], json!("3"));
        assert_eq!(out["aii"], json!("{\"w\":[0]}"));
        assert_eq!(out["id"], json!(7));
    }

    #[test]
    fn all_null_coerced_columns_are_typed_as_text() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("part_0.jsonl");
        std::fs::write(&source, "{\"id\":1,\"type\":null,\"aii\":null,\"misc\":null}\n").unwrap();
        let p = projection(&["type"], &["aii"], &["id", "type", "aii", "misc"]);
        let shaper = RecordShaper::new(Some(&p));
        let schema = ArrowConverter::new().infer_schema(&source, &shaper).unwrap();

        assert_eq!(schema.field(1).data_type(), &DataType::Utf8);
        assert_eq!(schema.field(2).data_type(), &DataType::Utf8);
        assert!(schema.field(1).is_nullable());
        assert_eq!(schema.field(3).data_type(), &DataType::Null);
    }

    #[test]
    fn shaper_without_projection_is_identity() {
        let shaper = RecordShaper::new(None);
        let rec = obj(json!({"b": {"x": 1}, "a": 2}));
        assert_eq!(shaper.shape(rec.clone()), rec);
    }
}
