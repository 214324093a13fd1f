//! Learned rule data models.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::Features;
use crate::mail::ItemId;
use crate::taxonomy::CategoryName;

/// What a rule's pattern is matched against.
///
/// Declaration order is evaluation order: narrowest scope first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleScope {
    /// Exact normalized sender address.
    SenderExact,
    /// Normalized sender domain.
    Domain,
    /// One normalized subject token.
    SubjectKeyword,
}

impl RuleScope {
    /// All scopes in evaluation order.
    pub const ORDER: [Self; 3] = [Self::SenderExact, Self::Domain, Self::SubjectKeyword];

    /// Parse from database string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sender-exact" => Some(Self::SenderExact),
            "domain" => Some(Self::Domain),
            "subject-keyword" => Some(Self::SubjectKeyword),
            _ => None,
        }
    }

    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SenderExact => "sender-exact",
            Self::Domain => "domain",
            Self::SubjectKeyword => "subject-keyword",
        }
    }
}

impl fmt::Display for RuleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleKey {
    /// Rule scope.
    pub scope: RuleScope,
    /// Normalized pattern.
    pub pattern: String,
    /// Target category.
    pub category: CategoryName,
}

impl RuleKey {
    /// Create a key; the pattern is lower-cased.
    #[must_use]
    pub fn new(scope: RuleScope, pattern: &str, category: CategoryName) -> Self {
        Self {
            scope,
            pattern: pattern.trim().to_lowercase(),
            category,
        }
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}->{}", self.scope, self.pattern, self.category)
    }
}

/// A learned pattern-to-category mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedRule {
    /// Rule scope.
    pub scope: RuleScope,
    /// Normalized pattern.
    pub pattern: String,
    /// Target category.
    pub category: CategoryName,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Number of items the rule classified.
    pub hit_count: u64,
    /// When the rule was created.
    pub created_at: DateTime<Utc>,
    /// When the confidence last changed.
    pub updated_at: DateTime<Utc>,
    /// When the rule last classified an item.
    pub last_hit: Option<DateTime<Utc>>,
}

impl LearnedRule {
    /// Create a rule at `confidence`.
    #[must_use]
    pub fn new(key: RuleKey, confidence: f64, now: DateTime<Utc>) -> Self {
        Self {
            scope: key.scope,
            pattern: key.pattern,
            category: key.category,
            confidence: confidence.clamp(0.0, 1.0),
            hit_count: 0,
            created_at: now,
            updated_at: now,
            last_hit: None,
        }
    }

    /// The rule's identity.
    #[must_use]
    pub fn key(&self) -> RuleKey {
        RuleKey {
            scope: self.scope,
            pattern: self.pattern.clone(),
            category: self.category.clone(),
        }
    }

    /// Most recent hit or update.
    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_hit
            .map_or(self.updated_at, |hit| hit.max(self.updated_at))
    }
}

/// A rule that classified an item.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    /// Matching rule's key.
    pub key: RuleKey,
    /// Rule confidence at match time.
    pub confidence: f64,
}

/// An observed user correction.
///
/// Append-only; replaying the log rebuilds the rule set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionEvent {
    /// Corrected item.
    pub item_id: ItemId,
    /// Category the system had assigned, if known.
    pub previous: Option<CategoryName>,
    /// Category the user moved the item to.
    pub corrected: CategoryName,
    /// Features extracted from the item.
    pub features: Features,
    /// When the correction was observed.
    pub observed_at: DateTime<Utc>,
}

/// Rule book tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Rules without hits or updates for this many days are pruned by
    /// maintenance.
    pub stale_after_days: u32,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            stale_after_days: 365,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_round_trip() {
        for scope in RuleScope::ORDER {
            assert_eq!(RuleScope::parse(scope.as_str()), Some(scope));
        }
        assert_eq!(RuleScope::parse("regex"), None);
    }

    #[test]
    fn test_scope_order_is_narrowest_first() {
        assert!(RuleScope::SenderExact < RuleScope::Domain);
        assert!(RuleScope::Domain < RuleScope::SubjectKeyword);
    }

    #[test]
    fn test_key_normalizes_pattern() {
        let key = RuleKey::new(RuleScope::Domain, " Vendor.TEST ", CategoryName::new("pro"));
        assert_eq!(key.pattern, "vendor.test");
        assert_eq!(key.to_string(), "domain:vendor.test->PRO");
    }

    #[test]
    fn test_last_activity() {
        let now = Utc::now();
        let mut rule = LearnedRule::new(
            RuleKey::new(RuleScope::SenderExact, "a@b.test", CategoryName::new("PRO")),
            0.75,
            now,
        );
        assert_eq!(rule.last_activity(), now);

        let later = now + chrono::Duration::hours(1);
        rule.last_hit = Some(later);
        assert_eq!(rule.last_activity(), later);
    }
}
