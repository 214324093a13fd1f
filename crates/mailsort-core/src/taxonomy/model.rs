//! Category data models.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of the designated fallback category.
pub const DEFAULT_CATEGORY: &str = "UNKNOWN";

/// Threshold used when a configured category does not specify one.
pub const DEFAULT_THRESHOLD: f64 = 0.6;

/// Upper-cased category identifier.
///
/// Names coming from outside the process (remote labels, persisted state)
/// must go through [`Taxonomy::resolve`](super::Taxonomy::resolve) before
/// they are trusted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct CategoryName(String);

impl CategoryName {
    /// Create a category name, normalized to trimmed upper case.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self(normalize(name))
    }

    /// The normalized name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CategoryName {
    fn from(name: String) -> Self {
        Self::new(&name)
    }
}

impl From<CategoryName> for String {
    fn from(name: CategoryName) -> Self {
        name.0
    }
}

impl fmt::Display for CategoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for CategoryName {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

/// Normalize a raw label: trim surrounding whitespace and quotes, upper-case.
pub(crate) fn normalize(label: &str) -> String {
    label
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim()
        .to_uppercase()
}

/// A mail category and where its mail goes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    /// Unique name.
    pub name: CategoryName,
    /// Destination folder. `None` leaves mail where it is.
    #[serde(default)]
    pub folder: Option<String>,
    /// Keywords used by the heuristic scorer.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Tie-break weight; higher wins.
    #[serde(default)]
    pub priority: i32,
    /// Minimum confidence for a result in this category to be accepted.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Free-text description, also sent to the remote classifier.
    #[serde(default)]
    pub description: String,
}

const fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

impl Category {
    /// Create a category routed to `folder` with default settings.
    #[must_use]
    pub fn new(name: &str, folder: Option<&str>) -> Self {
        Self {
            name: CategoryName::new(name),
            folder: folder.map(ToString::to_string),
            keywords: Vec::new(),
            priority: 0,
            threshold: DEFAULT_THRESHOLD,
            description: String::new(),
        }
    }

    /// Set the heuristic keywords.
    #[must_use]
    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    /// Set the tie-break priority.
    #[must_use]
    pub const fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the acceptance threshold.
    #[must_use]
    pub const fn threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Whether `confidence` clears this category's threshold.
    #[must_use]
    pub fn accepts(&self, confidence: f64) -> bool {
        confidence.is_finite() && confidence >= self.threshold
    }
}

/// The built-in category set used when none is configured.
#[must_use]
pub fn default_categories() -> Vec<Category> {
    vec![
        Category::new("SPAM", Some("Spam"))
            .keywords(["unsubscribe", "click here", "limited time", "act now", "free money"])
            .priority(1)
            .threshold(0.7)
            .description("Unsolicited mail and advertising"),
        Category::new("SHOPPING", Some("Folders/Shopping"))
            .keywords(["sale", "promo", "discount", "order", "cart", "delivery", "coupon"])
            .priority(2)
            .threshold(0.65)
            .description("Commercial offers, orders and deliveries"),
        Category::new("FINANCE", Some("Folders/Finance"))
            .keywords(["invoice", "payment", "bank", "transfer", "statement", "transaction", "account"])
            .priority(3)
            .threshold(0.8)
            .description("Banking, invoices and administrative payments"),
        Category::new("PRO", Some("Folders/Work"))
            .keywords(["meeting", "project", "client", "deadline", "report", "presentation"])
            .priority(4)
            .threshold(0.7)
            .description("Professional correspondence"),
        Category::new("URGENT", Some("Folders/ToProcess"))
            .keywords(["urgent", "asap", "important", "action required", "immediately"])
            .priority(5)
            .threshold(0.75)
            .description("Mail explicitly flagged as urgent"),
        Category::new("TRAVEL", Some("Folders/Travel"))
            .keywords(["ticket", "train", "flight", "booking", "hotel", "reservation", "itinerary"])
            .priority(2)
            .threshold(0.7)
            .description("Travel confirmations and itineraries"),
        Category::new("SOCIAL", Some("Folders/Social"))
            .keywords(["like", "comment", "follow", "share", "mention", "friend request"])
            .priority(1)
            .threshold(0.65)
            .description("Social network notifications"),
        Category::new("NEWSLETTER", Some("Folders/Newsletters"))
            .keywords(["newsletter", "weekly", "monthly", "digest", "subscribe", "unsubscribe"])
            .priority(1)
            .threshold(0.7)
            .description("Newsletters and digests"),
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_category_name_normalization() {
        assert_eq!(CategoryName::new("  finance ").as_str(), "FINANCE");
        assert_eq!(CategoryName::new("\"Pro\"").as_str(), "PRO");
        assert_eq!("newsletter".parse::<CategoryName>().unwrap().as_str(), "NEWSLETTER");
    }

    #[test]
    fn test_category_accepts_threshold() {
        let category = Category::new("PRO", Some("Work")).threshold(0.7);

        assert!(category.accepts(0.7));
        assert!(category.accepts(0.95));
        assert!(!category.accepts(0.69));
        assert!(!category.accepts(f64::NAN));
    }

    #[test]
    fn test_category_serde_defaults() {
        let category: Category = serde_json::from_str(r#"{"name": "travel"}"#).unwrap();

        assert_eq!(category.name.as_str(), "TRAVEL");
        assert!(category.folder.is_none());
        assert!(category.keywords.is_empty());
        assert!((category.threshold - DEFAULT_THRESHOLD).abs() < f64::EPSILON);
    }

    #[test]
    fn test_default_categories_have_folders() {
        let categories = default_categories();

        assert_eq!(categories.len(), 8);
        assert!(categories.iter().all(|c| c.folder.is_some()));
        assert!(categories.iter().all(|c| !c.keywords.is_empty()));
    }
}
