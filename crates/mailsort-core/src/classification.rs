//! Classification results.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mail::ItemId;
use crate::taxonomy::{CategoryName, Taxonomy};

/// How a result was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Method {
    /// Replayed from the fingerprint cache.
    Cache,
    /// Matched a learned rule.
    Rule,
    /// Answered by the remote classifier.
    BatchRemote,
    /// Keyword scoring fallback.
    Heuristic,
}

impl Method {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Rule => "rule",
            Self::BatchRemote => "batch-remote",
            Self::Heuristic => "heuristic",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of classifying one item.
///
/// Built through [`ClassificationResult::new`], which enforces that the
/// confidence clears the category threshold or the result is the default
/// category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Item the result applies to.
    pub item_id: ItemId,
    /// Assigned category.
    pub category: CategoryName,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// How the result was obtained.
    pub method: Method,
    /// When the result was produced.
    pub timestamp: DateTime<Utc>,
}

impl ClassificationResult {
    /// Build a result, falling back to the default category when
    /// `confidence` does not clear the threshold of `category`.
    ///
    /// A fallen-back result keeps the original confidence clamped to
    /// `[0, 1]`; non-finite confidences become 0.
    #[must_use]
    pub fn new(
        taxonomy: &Taxonomy,
        item_id: ItemId,
        category: CategoryName,
        confidence: f64,
        method: Method,
    ) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let category = if taxonomy.accepts(&category, confidence) {
            category
        } else {
            taxonomy.default_name().clone()
        };
        Self {
            item_id,
            category,
            confidence,
            method,
            timestamp: Utc::now(),
        }
    }

    /// Whether the result landed in the default category.
    #[must_use]
    pub fn is_default(&self, taxonomy: &Taxonomy) -> bool {
        taxonomy.is_default(&self.category)
    }
}
