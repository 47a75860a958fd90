//! Parquet output with atomic replacement.
//!
//! [`ParquetSink`] writes Arrow batches into a hidden temporary file next to
//! the final path and renames it into place only in [`ParquetSink::finish`].
//! Dropping an unfinished sink deletes the temporary file, so a failed
//! conversion leaves either the previous good output or nothing.
//!
//! Metadata helpers ([`parquet_row_count`], [`parquet_schema`]) read only the
//! footer.

use anyhow::{Context, Result};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{FileReader, SerializedFileReader};
use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Streaming Parquet writer that publishes its file atomically.
pub struct ParquetSink {
    output: PathBuf,
    tmp: NamedTempFile,
    writer: ArrowWriter<File>,
    rows: u64,
}

impl ParquetSink {
    /// Start writing `output` with the given schema. Parent directories are
    /// created as needed.
    ///
    /// # Errors
    /// Returns an error if the directory or temporary file cannot be created
    /// or the Arrow writer rejects the schema.
    pub fn create(output: impl AsRef<Path>, schema: SchemaRef) -> Result<Self> {
        let output = output.as_ref().to_path_buf();
        let parent = output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;

        let tmp = tempfile::Builder::new()
            .prefix(".")
            .suffix(".tmp")
            .tempfile_in(parent)
            .with_context(|| format!("create temporary file in {}", parent.display()))?;
        let file = tmp.as_file().try_clone().context("clone temporary file handle")?;

        let props = WriterProperties::builder()
            .set_compression(Compression::ZSTD(ZstdLevel::default()))
            .build();
        let writer = ArrowWriter::try_new(file, schema, Some(props)).context("create ArrowWriter")?;

        Ok(Self {
            output,
            tmp,
            writer,
            rows: 0,
        })
    }

    /// Append one batch.
    ///
    /// # Errors
    /// Returns an error if the batch does not match the schema or the write fails.
    pub fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        self.writer.write(batch).context("write batch to parquet")?;
        self.rows += batch.num_rows() as u64;
        Ok(())
    }

    /// Rows written so far.
    #[must_use]
    pub const fn rows(&self) -> u64 {
        self.rows
    }

    /// Close the writer, sync, and rename the file over the final path.
    /// Returns the number of rows written.
    ///
    /// # Errors
    /// Returns an error if closing, syncing, or renaming fails; the final path
    /// is left untouched in that case.
    pub fn finish(self) -> Result<u64> {
        let Self {
            output,
            tmp,
            writer,
            rows,
        } = self;
        writer.close().context("close ArrowWriter")?;
        tmp.as_file()
            .sync_all()
            .context("sync parquet output to disk")?;
        tmp.persist(&output)
            .map_err(|e| e.error)
            .with_context(|| format!("rename into {}", output.display()))?;
        Ok(rows)
    }
}

/// Number of rows recorded in a Parquet footer.
///
/// # Errors
/// Returns an error if the file cannot be opened or is not valid Parquet.
pub fn parquet_row_count(path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = SerializedFileReader::new(f).context("open SerializedFileReader")?;
    let rows = reader.metadata().file_metadata().num_rows();
    Ok(u64::try_from(rows).unwrap_or(0))
}

/// Arrow schema of a Parquet file.
///
/// # Errors
/// Returns an error if the file cannot be opened or is not valid Parquet.
pub fn parquet_schema(path: impl AsRef<Path>) -> Result<SchemaRef> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(f).context("open ParquetRecordBatchReader")?;
    Ok(builder.schema().clone())
}

/// Read every batch of a Parquet file. Intended for tests and small files.
///
/// # Errors
/// Returns an error if the file cannot be opened or decoded.
pub fn read_parquet_batches(path: impl AsRef<Path>) -> Result<Vec<RecordBatch>> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(f)
        .context("open ParquetRecordBatchReader")?
        .with_batch_size(64 * 1024)
        .build()
        .context("build ParquetRecordBatchReader")?;
    reader
        .map(|b| b.context("read next batch"))
        .collect()
}
