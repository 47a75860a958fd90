//! The closed set of record kinds the pipeline understands.
//!
//! Every source file lives under `<source_root>/<category>/...`, so the
//! category doubles as the first path segment of both the source and the
//! derived tree. The set is fixed at compile time; unknown names are
//! rejected at the boundary (configuration files, CLI arguments).

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An entity category (one OpenAlex record kind).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityCategory {
    Authors,
    Concepts,
    Domains,
    Fields,
    Funders,
    Institutions,
    Publishers,
    Sources,
    Subfields,
    Topics,
    Works,
}

impl EntityCategory {
    /// All categories in processing order.
    pub const ALL: [Self; 11] = [
        Self::Authors,
        Self::Concepts,
        Self::Domains,
        Self::Fields,
        Self::Funders,
        Self::Institutions,
        Self::Publishers,
        Self::Sources,
        Self::Subfields,
        Self::Topics,
        Self::Works,
    ];

    /// The directory name (and ledger tag) of this category.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Authors => "authors",
            Self::Concepts => "concepts",
            Self::Domains => "domains",
            Self::Fields => "fields",
            Self::Funders => "funders",
            Self::Institutions => "institutions",
            Self::Publishers => "publishers",
            Self::Sources => "sources",
            Self::Subfields => "subfields",
            Self::Topics => "topics",
            Self::Works => "works",
        }
    }

    /// Comma-separated list of every valid name, for error messages.
    #[must_use]
    pub fn expected_names() -> String {
        Self::ALL
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for EntityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityCategory {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| SyncError::UnknownCategory {
                name: s.to_string(),
                expected: Self::expected_names(),
            })
    }
}
