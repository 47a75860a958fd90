//! Test support for code built on this crate.
//!
//! - [`SourceTreeBuilder`] / [`write_jsonl`]: write compressed JSONL
//!   partitions the way the upstream producer lays them out.
//! - [`TestProject`]: a temporary project root with a matching
//!   [`SyncConfig`](crate::config::SyncConfig).
//! - [`ScriptedConverter`]: a [`ConversionEngine`](crate::convert::ConversionEngine)
//!   whose outcome is scripted per file (succeed, fail, fail introspection,
//!   sleep), so engine behaviour can be tested without Parquet I/O.
//!
//! ```
//! use openalex_sync::testing::{Script, ScriptedConverter, TestProject};
//! use serde_json::json;
//!
//! let project = TestProject::new()?;
//! project.source().records("works/part_0.gz", &[json!({"id": "W1"})])?;
//! let converter = ScriptedConverter::new().on("part_0.gz", Script::Fail("bad".into()));
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod fixtures;
pub mod scripted;

pub use fixtures::*;
pub use scripted::*;
