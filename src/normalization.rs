//! Per-category schema normalization.
//!
//! Files of one category drift in shape over time: a column that is a
//! struct in one partition is a string or null in the next. The policy lists,
//! per [`EntityCategory`], which columns are forced to text and which are
//! serialized from structures to text, so every partition of a category ends
//! up with the same column types.
//!
//! The rules come from a JSON document keyed by category name:
//!
//! ```json
//! {
//!   "works": {
//!     "toText": ["type"],
//!     "toSerializedText": ["abstract_inverted_index"]
//!   }
//! }
//! ```
//!
//! The legacy keys `columns_to_varchar` / `struct_columns_to_json` are
//! accepted as aliases. Unknown categories, unknown keys, and columns listed
//! in both sets are rejected at load time.

use crate::category::EntityCategory;
use crate::error::SyncError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Column-level rules of one category.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NormalizationRules {
    /// Columns cast to text; strings stay verbatim.
    #[serde(default, rename = "toText", alias = "columns_to_varchar")]
    pub to_text: BTreeSet<String>,
    /// Columns whose value is serialized to JSON text.
    #[serde(
        default,
        rename = "toSerializedText",
        alias = "struct_columns_to_json"
    )]
    pub to_serialized_text: BTreeSet<String>,
}

static NO_RULES: NormalizationRules = NormalizationRules {
    to_text: BTreeSet::new(),
    to_serialized_text: BTreeSet::new(),
};

impl NormalizationRules {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_text.is_empty() && self.to_serialized_text.is_empty()
    }

    /// The transform these rules assign to `column`.
    #[must_use]
    pub fn transform_for(&self, column: &str) -> Transform {
        if self.to_text.contains(column) {
            Transform::CastToText
        } else if self.to_serialized_text.contains(column) {
            Transform::SerializeToText
        } else {
            Transform::Identity
        }
    }

    fn check_disjoint(&self, category: EntityCategory) -> Result<(), SyncError> {
        match self.to_text.intersection(&self.to_serialized_text).next() {
            Some(column) => Err(SyncError::ConflictingRule {
                category: category.to_string(),
                column: column.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// What happens to one column during conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transform {
    /// Pass the value through unchanged.
    Identity,
    /// Text stays text; anything else becomes its JSON text.
    CastToText,
    /// Any non-null value becomes its JSON serialization.
    SerializeToText,
}

/// One entry of a [`Projection`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectedColumn {
    pub name: String,
    pub transform: Transform,
}

impl ProjectedColumn {
    /// The column name as an identifier in the projection target, quoted
    /// when needed.
    #[must_use]
    pub fn identifier(&self) -> String {
        quote_identifier(&self.name)
    }
}

/// Ordered `(column, transform)` list handed to the conversion engine.
///
/// Built only by [`NormalizationPolicy::build_projection`]: one entry per
/// observed column, in observed order, no duplicates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Projection {
    columns: Vec<ProjectedColumn>,
}

impl Projection {
    #[must_use]
    pub fn columns(&self) -> &[ProjectedColumn] {
        &self.columns
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Transform for `column`, or `None` when the column is not projected.
    #[must_use]
    pub fn transform_of(&self, column: &str) -> Option<Transform> {
        self.columns
            .iter()
            .find(|c| c.name == column)
            .map(|c| c.transform)
    }

    /// Number of columns with a non-identity transform.
    #[must_use]
    pub fn coerced(&self) -> usize {
        self.columns
            .iter()
            .filter(|c| c.transform != Transform::Identity)
            .count()
    }
}

/// Renders the projection as a select list, for logging.
impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, col) in self.columns.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            let ident = col.identifier();
            let alias = format!("\"{}\"", col.name.replace('"', "\"\""));
            match col.transform {
                Transform::Identity => write!(f, "{ident} AS {alias}")?,
                Transform::CastToText => write!(f, "CAST({ident} AS VARCHAR) AS {alias}")?,
                Transform::SerializeToText => {
                    write!(f, "to_json({ident})::VARCHAR AS {alias}")?;
                }
            }
        }
        Ok(())
    }
}

/// Words that cannot appear bare as a column identifier.
const RESERVED: &[&str] = &[
    "all", "and", "as", "asc", "between", "by", "case", "cast", "check", "column", "create",
    "default", "desc", "distinct", "domain", "else", "end", "false", "from", "group", "having",
    "in", "is", "join", "like", "limit", "not", "null", "on", "or", "order", "select", "source",
    "table", "then", "to", "true", "type", "union", "unique", "user", "using", "version", "when",
    "where", "with", "year",
];

/// Quote `name` if it is a reserved word or not a plain identifier.
///
/// Plain identifiers are `[A-Za-z_][A-Za-z0-9_]*`. Embedded double quotes are
/// doubled.
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    let plain = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    let reserved = RESERVED.contains(&name.to_ascii_lowercase().as_str());
    if plain && !reserved {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Normalization rules for every configured category.
#[derive(Clone, Debug, Default)]
pub struct NormalizationPolicy {
    rules: HashMap<EntityCategory, NormalizationRules>,
}

impl NormalizationPolicy {
    /// A policy that normalizes nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a policy from already-typed rules, checking disjointness.
    ///
    /// # Errors
    /// Returns [`SyncError::ConflictingRule`] when a column is in both sets.
    pub fn from_rules(
        rules: impl IntoIterator<Item = (EntityCategory, NormalizationRules)>,
    ) -> Result<Self, SyncError> {
        let rules: HashMap<_, _> = rules.into_iter().collect();
        for (category, r) in &rules {
            r.check_disjoint(*category)?;
        }
        Ok(Self { rules })
    }

    /// Parse the JSON rules document.
    ///
    /// # Errors
    /// Returns an error for malformed JSON, unknown keys, unknown categories,
    /// or overlapping rule sets.
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: BTreeMap<String, NormalizationRules> =
            serde_json::from_str(text).context("parse normalization rules")?;
        let mut typed = Vec::with_capacity(raw.len());
        for (name, r) in raw {
            let category: EntityCategory = name.parse()?;
            typed.push((category, r));
        }
        Ok(Self::from_rules(typed)?)
    }

    /// Load the rules file at `path`. A missing file yields an empty policy.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(
                path = %path.display(),
                "normalization config not found, converting without normalization"
            );
            return Ok(Self::empty());
        }
        let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let policy =
            Self::from_json(&text).with_context(|| format!("load {}", path.display()))?;
        info!(
            path = %path.display(),
            categories = policy.rules.len(),
            "loaded normalization config"
        );
        Ok(policy)
    }

    /// Rules of `category`; empty when unconfigured.
    #[must_use]
    pub fn rules_for(&self, category: EntityCategory) -> &NormalizationRules {
        self.rules.get(&category).unwrap_or(&NO_RULES)
    }

    #[must_use]
    pub fn needs_normalization(&self, category: EntityCategory) -> bool {
        !self.rules_for(category).is_empty()
    }

    /// Map every observed column to its transform, keeping observed order.
    ///
    /// A repeated name in `observed` is projected once, at its first position.
    #[must_use]
    pub fn build_projection<S: AsRef<str>>(
        &self,
        category: EntityCategory,
        observed: &[S],
    ) -> Projection {
        let rules = self.rules_for(category);
        let mut seen = BTreeSet::new();
        let columns = observed
            .iter()
            .map(AsRef::as_ref)
            .filter(|name| seen.insert(*name))
            .map(|name| ProjectedColumn {
                name: name.to_string(),
                transform: rules.transform_for(name),
            })
            .collect();
        Projection { columns }
    }
}
