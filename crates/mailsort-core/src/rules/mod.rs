//! Learned rules.
//!
//! The [`RuleBook`] is the in-memory working set consulted before any
//! remote call. Rules are scoped by sender address, sender domain or
//! subject keyword and evaluated narrowest scope first:
//!
//! 1. Within a scope the highest confidence wins, then the highest category
//!    priority, then the most recent hit.
//! 2. A rule below its category's threshold is skipped, not fatal; the next
//!    candidate is tried.
//!
//! Rules are only created and changed by the [`Learner`](crate::Learner),
//! which writes them through a [`RuleStore`].

mod model;
mod repository;
mod store;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

pub use model::{
    CorrectionEvent, LearnedRule, RuleKey, RuleMatch, RuleScope, RulesConfig,
};
pub use repository::SqliteRuleStore;
pub use store::{MemoryRuleStore, RuleStore};

use crate::fingerprint::Features;
use crate::mail::MailItem;
use crate::taxonomy::Taxonomy;

type Slot = (RuleScope, String);

/// In-memory learned rule set.
#[derive(Debug)]
pub struct RuleBook {
    taxonomy: Arc<Taxonomy>,
    config: RulesConfig,
    rules: RwLock<HashMap<Slot, Vec<LearnedRule>>>,
}

impl RuleBook {
    /// Create an empty rule book.
    #[must_use]
    pub fn new(taxonomy: Arc<Taxonomy>, config: RulesConfig) -> Self {
        Self {
            taxonomy,
            config,
            rules: RwLock::new(HashMap::new()),
        }
    }

    /// Find the rule that classifies `item`, if any.
    ///
    /// A match increments the rule's hit count and refreshes its last hit.
    #[must_use]
    pub fn evaluate(&self, item: &MailItem) -> Option<RuleMatch> {
        self.evaluate_features(&Features::of(item))
    }

    /// Find the rule that classifies an item with `features`.
    #[must_use]
    pub fn evaluate_features(&self, features: &Features) -> Option<RuleMatch> {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);

        for scope in RuleScope::ORDER {
            let patterns: Vec<&str> = match scope {
                RuleScope::SenderExact => vec![features.sender.as_str()],
                RuleScope::Domain => vec![features.domain.as_str()],
                RuleScope::SubjectKeyword => {
                    features.subject_tokens.iter().map(String::as_str).collect()
                }
            };

            let best = patterns
                .into_iter()
                .filter(|p| !p.is_empty())
                .filter_map(|p| rules.get(&(scope, p.to_string())))
                .flatten()
                .filter(|r| self.taxonomy.accepts(&r.category, r.confidence))
                .max_by(|a, b| self.rank(a, b))
                .map(LearnedRule::key);

            if let Some(key) = best {
                let rule = slot_rule_mut(&mut rules, &key)?;
                rule.hit_count += 1;
                rule.last_hit = Some(Utc::now());
                debug!(rule = %key, confidence = rule.confidence, "rule matched");
                return Some(RuleMatch {
                    confidence: rule.confidence,
                    key,
                });
            }
        }
        None
    }

    /// Ordering used to pick among matching rules of one scope.
    fn rank(&self, a: &LearnedRule, b: &LearnedRule) -> Ordering {
        a.confidence
            .total_cmp(&b.confidence)
            .then_with(|| {
                self.taxonomy
                    .priority(&a.category)
                    .cmp(&self.taxonomy.priority(&b.category))
            })
            .then_with(|| a.last_hit.cmp(&b.last_hit))
            // Stable choice when everything else ties
            .then_with(|| b.category.cmp(&a.category))
    }

    /// Insert or replace a rule.
    pub fn upsert(&self, rule: LearnedRule) {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let slot = rules.entry((rule.scope, rule.pattern.clone())).or_default();
        match slot.iter_mut().find(|r| r.category == rule.category) {
            Some(existing) => *existing = rule,
            None => slot.push(rule),
        }
    }

    /// Change a rule's confidence in place, keeping its hit statistics.
    ///
    /// `f` maps the current confidence to the new one; the result is
    /// clamped to `[0, 1]`. Returns the updated rule, or `None` if there is
    /// no rule under `key`.
    pub fn adjust(
        &self,
        key: &RuleKey,
        updated_at: DateTime<Utc>,
        f: impl FnOnce(f64) -> f64,
    ) -> Option<LearnedRule> {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let rule = slot_rule_mut(&mut rules, key)?;
        rule.confidence = f(rule.confidence).clamp(0.0, 1.0);
        rule.updated_at = updated_at;
        Some(rule.clone())
    }

    /// Remove a rule, returning it.
    pub fn remove(&self, key: &RuleKey) -> Option<LearnedRule> {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let slot_key = (key.scope, key.pattern.clone());
        let slot = rules.get_mut(&slot_key)?;
        let position = slot.iter().position(|r| r.category == key.category)?;
        let removed = slot.swap_remove(position);
        if slot.is_empty() {
            rules.remove(&slot_key);
        }
        Some(removed)
    }

    /// Copy of one rule.
    #[must_use]
    pub fn get(&self, key: &RuleKey) -> Option<LearnedRule> {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        rules
            .get(&(key.scope, key.pattern.clone()))?
            .iter()
            .find(|r| r.category == key.category)
            .cloned()
    }

    /// All rules on one scope and pattern, whatever their category.
    #[must_use]
    pub fn rules_for(&self, scope: RuleScope, pattern: &str) -> Vec<LearnedRule> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(scope, pattern.to_lowercase()))
            .cloned()
            .unwrap_or_default()
    }

    /// Copy of every rule, ordered by key.
    #[must_use]
    pub fn all(&self) -> Vec<LearnedRule> {
        let mut all: Vec<LearnedRule> = self
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flatten()
            .cloned()
            .collect();
        all.sort_by_key(LearnedRule::key);
        all
    }

    /// Replace the whole rule set.
    ///
    /// Rules targeting categories outside the taxonomy, and rules with a
    /// confidence outside `[0, 1]`, are dropped.
    pub fn replace_all(&self, rules: Vec<LearnedRule>) {
        let mut fresh: HashMap<Slot, Vec<LearnedRule>> = HashMap::new();
        for rule in rules {
            if !self.taxonomy.contains(&rule.category) || !(0.0..=1.0).contains(&rule.confidence) {
                debug!(rule = %rule.key(), "dropping rule outside the taxonomy");
                continue;
            }
            let slot = fresh.entry((rule.scope, rule.pattern.clone())).or_default();
            slot.retain(|r| r.category != rule.category);
            slot.push(rule);
        }
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = fresh;
    }

    /// Remove rules idle beyond the configured horizon.
    ///
    /// Returns the removed rules so they can be deleted from durable storage.
    pub fn prune_stale(&self, now: DateTime<Utc>) -> Vec<LearnedRule> {
        let cutoff = now - Duration::days(i64::from(self.config.stale_after_days));
        let mut removed = Vec::new();
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        for slot in rules.values_mut() {
            let (stale, kept): (Vec<_>, Vec<_>) = slot
                .drain(..)
                .partition(|r| r.last_activity() < cutoff);
            *slot = kept;
            removed.extend(stale);
        }
        rules.retain(|_, slot| !slot.is_empty());
        removed
    }

    /// Number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Whether there are no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn slot_rule_mut<'a>(
    rules: &'a mut HashMap<Slot, Vec<LearnedRule>>,
    key: &RuleKey,
) -> Option<&'a mut LearnedRule> {
    rules
        .get_mut(&(key.scope, key.pattern.clone()))?
        .iter_mut()
        .find(|r| r.category == key.category)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::taxonomy::CategoryName;

    fn book() -> RuleBook {
        RuleBook::new(Arc::new(Taxonomy::default()), RulesConfig::default())
    }

    fn rule(scope: RuleScope, pattern: &str, category: &str, confidence: f64) -> LearnedRule {
        LearnedRule::new(
            RuleKey::new(scope, pattern, CategoryName::new(category)),
            confidence,
            Utc::now(),
        )
    }

    fn item(sender: &str, subject: &str) -> MailItem {
        MailItem::new("1", "INBOX", sender, subject)
    }

    #[test]
    fn test_sender_rule_beats_domain_rule() {
        let book = book();
        book.upsert(rule(RuleScope::SenderExact, "boss@corp.test", "PRO", 0.75));
        book.upsert(rule(RuleScope::Domain, "corp.test", "NEWSLETTER", 0.95));

        let hit = book.evaluate(&item("Boss <boss@corp.test>", "Hello")).unwrap();
        assert_eq!(hit.key.category.as_str(), "PRO");
        assert_eq!(hit.key.scope, RuleScope::SenderExact);

        let other = book.evaluate(&item("news@corp.test", "Hello")).unwrap();
        assert_eq!(other.key.category.as_str(), "NEWSLETTER");
    }

    #[test]
    fn test_rule_below_threshold_is_skipped() {
        let book = book();
        // FINANCE threshold is 0.8
        book.upsert(rule(RuleScope::SenderExact, "bank@bank.test", "FINANCE", 0.75));
        book.upsert(rule(RuleScope::Domain, "bank.test", "SPAM", 0.8));

        let hit = book.evaluate(&item("bank@bank.test", "Statement")).unwrap();
        assert_eq!(hit.key.category.as_str(), "SPAM");
        assert_eq!(hit.key.scope, RuleScope::Domain);
    }

    #[test]
    fn test_ties_broken_by_priority() {
        let book = book();
        book.upsert(rule(RuleScope::SubjectKeyword, "report", "NEWSLETTER", 0.8));
        book.upsert(rule(RuleScope::SubjectKeyword, "report", "PRO", 0.8));

        let hit = book.evaluate(&item("x@y.test", "Weekly report")).unwrap();
        // PRO priority 4 > NEWSLETTER priority 1
        assert_eq!(hit.key.category.as_str(), "PRO");
    }

    #[test]
    fn test_ties_broken_by_recent_hit() {
        let book = book();
        let mut older = rule(RuleScope::SubjectKeyword, "ticket", "TRAVEL", 0.8);
        older.last_hit = Some(Utc::now() - Duration::days(3));
        let mut newer = rule(RuleScope::SubjectKeyword, "booking", "SHOPPING", 0.8);
        newer.last_hit = Some(Utc::now());
        // TRAVEL and SHOPPING share priority 2
        book.upsert(older);
        book.upsert(newer);

        let hit = book.evaluate(&item("x@y.test", "Ticket booking")).unwrap();
        assert_eq!(hit.key.category.as_str(), "SHOPPING");
    }

    #[test]
    fn test_highest_confidence_wins_within_scope() {
        let book = book();
        book.upsert(rule(RuleScope::SubjectKeyword, "invoice", "SHOPPING", 0.7));
        book.upsert(rule(RuleScope::SubjectKeyword, "due", "FINANCE", 0.9));

        let hit = book.evaluate(&item("x@y.test", "Invoice due")).unwrap();
        assert_eq!(hit.key.category.as_str(), "FINANCE");
    }

    #[test]
    fn test_match_counts_hits() {
        let book = book();
        let r = rule(RuleScope::SenderExact, "boss@corp.test", "PRO", 0.8);
        let key = r.key();
        book.upsert(r);

        assert!(book.evaluate(&item("boss@corp.test", "a")).is_some());
        assert!(book.evaluate(&item("boss@corp.test", "b")).is_some());

        let stored = book.get(&key).unwrap();
        assert_eq!(stored.hit_count, 2);
        assert!(stored.last_hit.is_some());
    }

    #[test]
    fn test_no_rule_means_none() {
        let book = book();
        assert!(book.evaluate(&item("x@y.test", "Hello")).is_none());
    }

    #[test]
    fn test_remove_and_rules_for() {
        let book = book();
        book.upsert(rule(RuleScope::Domain, "corp.test", "PRO", 0.8));
        book.upsert(rule(RuleScope::Domain, "corp.test", "SPAM", 0.8));
        assert_eq!(book.rules_for(RuleScope::Domain, "CORP.test").len(), 2);

        let key = RuleKey::new(RuleScope::Domain, "corp.test", CategoryName::new("SPAM"));
        assert!(book.remove(&key).is_some());
        assert!(book.remove(&key).is_none());
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_replace_all_drops_unknown_categories() {
        let book = book();
        book.replace_all(vec![
            rule(RuleScope::Domain, "corp.test", "PRO", 0.8),
            rule(RuleScope::Domain, "corp.test", "CRYPTO", 0.8),
        ]);
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_prune_stale() {
        let book = RuleBook::new(
            Arc::new(Taxonomy::default()),
            RulesConfig {
                stale_after_days: 30,
            },
        );
        let mut old = rule(RuleScope::Domain, "old.test", "PRO", 0.8);
        old.updated_at = Utc::now() - Duration::days(60);
        let fresh = rule(RuleScope::Domain, "new.test", "PRO", 0.8);
        book.upsert(old);
        book.upsert(fresh);

        let removed = book.prune_stale(Utc::now());
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].pattern, "old.test");
        assert_eq!(book.len(), 1);
    }
}
