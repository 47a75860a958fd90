//! File formats and filesystem walking.

pub mod compression;
pub mod glob;
pub mod jsonl;
pub mod parquet;
