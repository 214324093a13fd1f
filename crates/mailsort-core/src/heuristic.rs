//! Keyword scoring fallback.
//!
//! Always available: used whenever the remote classifier is disabled,
//! rate limited, failing, or returns an unusable label for an item.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::classification::{ClassificationResult, Method};
use crate::mail::MailItem;
use crate::taxonomy::{CategoryName, Taxonomy};

/// Heuristic scorer tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicConfig {
    /// Weight of a keyword found in the sender.
    pub sender_weight: f64,
    /// Weight of a keyword found in the subject.
    pub subject_weight: f64,
    /// Weight of a keyword found in the body.
    pub body_weight: f64,
    /// Occurrences counted per keyword and field.
    pub max_occurrences: usize,
    /// Score that maps to full confidence.
    pub normalizer: f64,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            sender_weight: 1.5,
            subject_weight: 2.0,
            body_weight: 1.0,
            max_occurrences: 3,
            normalizer: 4.0,
        }
    }
}

/// Weighted keyword scorer over the taxonomy's keyword lists.
#[derive(Debug, Clone)]
pub struct HeuristicScorer {
    taxonomy: Arc<Taxonomy>,
    config: HeuristicConfig,
}

impl HeuristicScorer {
    /// Create a scorer.
    #[must_use]
    pub const fn new(taxonomy: Arc<Taxonomy>, config: HeuristicConfig) -> Self {
        Self { taxonomy, config }
    }

    /// Best category for `item` and its confidence.
    ///
    /// Returns the default category at 0 when no category clears its
    /// threshold.
    #[must_use]
    pub fn score(&self, item: &MailItem) -> (CategoryName, f64) {
        let sender = words(&item.sender);
        let subject = words(&item.subject);
        let body = words(&item.body);

        let best = self
            .taxonomy
            .assignable()
            .filter(|c| !c.keywords.is_empty())
            .map(|c| {
                let raw: f64 = c
                    .keywords
                    .iter()
                    .map(|k| words(k))
                    .filter(|k| !k.is_empty())
                    .map(|k| {
                        self.config.sender_weight * self.occurrences(&sender, &k)
                            + self.config.subject_weight * self.occurrences(&subject, &k)
                            + self.config.body_weight * self.occurrences(&body, &k)
                    })
                    .sum();
                (c, self.confidence(raw))
            })
            .filter(|(c, confidence)| *confidence > 0.0 && c.accepts(*confidence))
            .max_by(|(a, ca), (b, cb)| ca.total_cmp(cb).then_with(|| a.priority.cmp(&b.priority)));

        match best {
            Some((category, confidence)) => (category.name.clone(), confidence),
            None => (self.taxonomy.default_name().clone(), 0.0),
        }
    }

    /// Score `item` into a result carrying [`Method::Heuristic`].
    #[must_use]
    pub fn classify(&self, item: &MailItem) -> ClassificationResult {
        let (category, confidence) = self.score(item);
        ClassificationResult::new(
            &self.taxonomy,
            item.id.clone(),
            category,
            confidence,
            Method::Heuristic,
        )
    }

    /// Whole-word matches of `keyword` in `haystack`, capped per field.
    #[allow(clippy::cast_precision_loss)]
    fn occurrences(&self, haystack: &[String], keyword: &[String]) -> f64 {
        haystack
            .windows(keyword.len())
            .filter(|window| *window == keyword)
            .take(self.config.max_occurrences)
            .count() as f64
    }

    fn confidence(&self, raw: f64) -> f64 {
        if self.config.normalizer <= 0.0 {
            return 0.0;
        }
        (raw / self.config.normalizer).clamp(0.0, 1.0)
    }
}

/// Lowercased alphanumeric words of `text`.
fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::taxonomy::Category;

    fn scorer() -> HeuristicScorer {
        HeuristicScorer::new(Arc::new(Taxonomy::default()), HeuristicConfig::default())
    }

    #[test]
    fn test_subject_keywords_score() {
        let item = MailItem::new("1", "INBOX", "alerts@bank.test", "Payment received")
            .with_body("Your bank statement and payment details");

        let (category, confidence) = scorer().score(&item);
        assert_eq!(category.as_str(), "FINANCE");
        assert!(confidence >= 0.8);
    }

    #[test]
    fn test_no_keywords_yields_default() {
        let item = MailItem::new("1", "INBOX", "x@y.test", "Hello there");

        let (category, confidence) = scorer().score(&item);
        assert_eq!(category.as_str(), "UNKNOWN");
        assert!(confidence.abs() < f64::EPSILON);
    }

    #[test]
    fn test_weak_signal_below_threshold_yields_default() {
        // One body mention scores 0.25, below every threshold
        let item = MailItem::new("1", "INBOX", "x@y.test", "Hello").with_body("see the project");

        let (category, _) = scorer().score(&item);
        assert_eq!(category.as_str(), "UNKNOWN");
    }

    #[test]
    fn test_occurrences_are_capped() {
        let taxonomy = Taxonomy::new(vec![
            Category::new("A", Some("A")).keywords(["alpha"]).threshold(0.1),
        ])
        .unwrap();
        let scorer = HeuristicScorer::new(Arc::new(taxonomy), HeuristicConfig::default());
        let item = MailItem::new("1", "INBOX", "x@y.test", "Hi").with_body(&"alpha ".repeat(50));

        let (category, confidence) = scorer.score(&item);
        assert_eq!(category.as_str(), "A");
        assert!((confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_keywords_match_whole_words() {
        let taxonomy = Taxonomy::new(vec![
            Category::new("A", Some("A")).keywords(["like", "act now"]).threshold(0.1),
        ])
        .unwrap();
        let scorer = HeuristicScorer::new(Arc::new(taxonomy), HeuristicConfig::default());

        let inside = MailItem::new("1", "INBOX", "x@y.test", "Hi")
            .with_body("likely unlikely, react nowhere");
        let (category, confidence) = scorer.score(&inside);
        assert_eq!(category.as_str(), "UNKNOWN");
        assert!(confidence.abs() < f64::EPSILON);

        let whole = MailItem::new("1", "INBOX", "x@y.test", "Hi").with_body("Like this? Act  now!");
        let (category, confidence) = scorer.score(&whole);
        assert_eq!(category.as_str(), "A");
        assert!((confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_priority_breaks_ties() {
        // "urgent" (URGENT, priority 5) vs "meeting" (PRO, priority 4)
        let item =
            MailItem::new("1", "INBOX", "x@y.test", "urgent meeting").with_body("urgent meeting");

        let (category, confidence) = scorer().score(&item);
        assert!((confidence - 0.75).abs() < 1e-9);
        assert_eq!(category.as_str(), "URGENT");
    }

    #[test]
    fn test_classify_sets_method() {
        let item = MailItem::new("1", "INBOX", "x@y.test", "Hello");
        let result = scorer().classify(&item);

        assert_eq!(result.method, Method::Heuristic);
        assert_eq!(result.item_id, item.id);
    }

    proptest! {
        #[test]
        fn prop_confidence_in_unit_range(subject in ".{0,120}", body in ".{0,400}") {
            let item = MailItem::new("1", "INBOX", "x@y.test", subject).with_body(&body);
            let (_, confidence) = scorer().score(&item);
            prop_assert!((0.0..=1.0).contains(&confidence));
        }
    }
}
