//! Rule learning from user corrections.
//!
//! A correction is an item the user moved somewhere other than where it was
//! placed. Each correction reinforces or creates rules for the corrected
//! category and decays rules that disagree on the same pattern. The learner
//! never classifies anything itself.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::dispatch::FewShotExample;
use crate::fingerprint::Features;
use crate::mail::ItemId;
use crate::rules::{CorrectionEvent, LearnedRule, RuleBook, RuleKey, RuleScope, RuleStore};
use crate::taxonomy::{CategoryName, Taxonomy};
use crate::{Error, Result};

/// Learner tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerConfig {
    /// Confidence of a newly created rule.
    pub seed: f64,
    /// Increase per confirming correction.
    pub step: f64,
    /// Highest confidence reinforcement can reach.
    pub ceiling: f64,
    /// Decrease applied to a rule contradicted by a correction.
    pub conflict_penalty: f64,
    /// Contradicted rules below this confidence are deleted.
    pub floor: f64,
    /// Subject keywords turned into rules per correction.
    pub top_keywords: usize,
    /// Shared mailbox providers for which no domain rule is learned.
    pub free_mail_domains: Vec<String>,
    /// Few-shot examples kept per category.
    pub examples_per_category: usize,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            seed: 0.75,
            step: 0.10,
            ceiling: 0.95,
            conflict_penalty: 0.25,
            floor: 0.30,
            top_keywords: 3,
            free_mail_domains: [
                "gmail.com",
                "googlemail.com",
                "outlook.com",
                "hotmail.com",
                "live.com",
                "yahoo.com",
                "icloud.com",
                "proton.me",
                "protonmail.com",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            examples_per_category: 2,
        }
    }
}

/// What one correction changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrectionOutcome {
    /// Rules created at the seed confidence.
    pub created: Vec<RuleKey>,
    /// Rules whose confidence was raised.
    pub reinforced: Vec<RuleKey>,
    /// Contradicted rules whose confidence was lowered.
    pub decayed: Vec<RuleKey>,
    /// Contradicted rules deleted below the floor.
    pub deleted: Vec<RuleKey>,
    /// The correction agreed with the previous category and changed nothing.
    pub ignored: bool,
}

/// Turns corrections into rules.
pub struct Learner {
    taxonomy: Arc<Taxonomy>,
    rules: Arc<RuleBook>,
    store: Arc<dyn RuleStore>,
    config: LearnerConfig,
    serial: Mutex<()>,
}

impl std::fmt::Debug for Learner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Learner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Learner {
    /// Create a learner writing to `rules` and `store`.
    #[must_use]
    pub fn new(
        taxonomy: Arc<Taxonomy>,
        rules: Arc<RuleBook>,
        store: Arc<dyn RuleStore>,
        config: LearnerConfig,
    ) -> Self {
        Self {
            taxonomy,
            rules,
            store,
            config,
            serial: Mutex::new(()),
        }
    }

    /// Learn from one correction.
    ///
    /// A correction whose `previous` equals `corrected` is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownCategory`] if `corrected` is not an assignable
    /// category, or a storage error if the rule store fails.
    pub async fn observe_correction(
        &self,
        item_id: ItemId,
        previous: Option<CategoryName>,
        corrected: CategoryName,
        features: Features,
    ) -> Result<CorrectionOutcome> {
        if !self.taxonomy.contains(&corrected) || self.taxonomy.is_default(&corrected) {
            return Err(Error::UnknownCategory(corrected.to_string()));
        }
        if previous.as_ref() == Some(&corrected) {
            debug!(item = %item_id, category = %corrected, "correction matches placement");
            return Ok(CorrectionOutcome {
                ignored: true,
                ..CorrectionOutcome::default()
            });
        }

        let event = CorrectionEvent {
            item_id,
            previous,
            corrected,
            features,
            observed_at: Utc::now(),
        };

        let _guard = self.serial.lock().await;
        // Logged first: a rule write failing below still leaves the
        // correction replayable by `rebuild`.
        self.store.append_correction(&event).await?;
        let outcome = self.apply(&event).await?;

        info!(
            item = %event.item_id,
            from = ?event.previous.as_ref().map(CategoryName::as_str),
            to = %event.corrected,
            created = outcome.created.len(),
            reinforced = outcome.reinforced.len(),
            decayed = outcome.decayed.len(),
            deleted = outcome.deleted.len(),
            "learned from correction"
        );
        Ok(outcome)
    }

    /// Rebuild every rule by replaying the correction log.
    ///
    /// Returns the number of replayed corrections.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule store fails.
    pub async fn rebuild(&self) -> Result<usize> {
        let _guard = self.serial.lock().await;

        for rule in self.store.list().await? {
            self.store.delete(&rule.key()).await?;
        }
        self.rules.replace_all(Vec::new());

        let events = self.store.corrections().await?;
        let mut replayed = 0;
        for event in &events {
            if !self.taxonomy.contains(&event.corrected)
                || self.taxonomy.is_default(&event.corrected)
            {
                debug!(
                    item = %event.item_id,
                    category = %event.corrected,
                    "skipping correction outside the taxonomy"
                );
                continue;
            }
            self.apply(event).await?;
            replayed += 1;
        }

        info!(replayed, rules = self.rules.len(), "rebuilt rules from correction log");
        Ok(replayed)
    }

    /// Recent corrections as few-shot examples, newest first.
    ///
    /// At most `examples_per_category` per category and `max` overall.
    ///
    /// # Errors
    ///
    /// Returns an error if the correction log cannot be read.
    pub async fn few_shot_examples(&self, max: usize) -> Result<Vec<FewShotExample>> {
        let events = self.store.corrections().await?;
        let mut per_category: HashMap<CategoryName, usize> = HashMap::new();
        let mut examples = Vec::new();

        for event in events.iter().rev() {
            if examples.len() >= max {
                break;
            }
            let count = per_category.entry(event.corrected.clone()).or_default();
            if *count >= self.config.examples_per_category {
                continue;
            }
            *count += 1;
            examples.push(FewShotExample {
                sender: event.features.sender.clone(),
                subject: event.features.subject_tokens.join(" "),
                category: event.corrected.to_string(),
            });
        }
        Ok(examples)
    }

    /// Learner configuration.
    #[must_use]
    pub const fn config(&self) -> &LearnerConfig {
        &self.config
    }

    /// Candidate (scope, pattern) pairs for a correction.
    fn candidates(&self, features: &Features) -> Vec<(RuleScope, String)> {
        let mut candidates = Vec::new();
        if !features.sender.is_empty() {
            candidates.push((RuleScope::SenderExact, features.sender.clone()));
        }
        if !features.domain.is_empty()
            && !self
                .config
                .free_mail_domains
                .iter()
                .any(|d| d.eq_ignore_ascii_case(&features.domain))
        {
            candidates.push((RuleScope::Domain, features.domain.clone()));
        }
        candidates.extend(
            salient_keywords(&features.subject_tokens, self.config.top_keywords)
                .into_iter()
                .map(|k| (RuleScope::SubjectKeyword, k)),
        );
        candidates
    }

    async fn apply(&self, event: &CorrectionEvent) -> Result<CorrectionOutcome> {
        let now = event.observed_at;
        let penalty = self.config.conflict_penalty;
        let mut outcome = CorrectionOutcome::default();

        for (scope, pattern) in self.candidates(&event.features) {
            let conflicting: Vec<RuleKey> = self
                .rules
                .rules_for(scope, &pattern)
                .iter()
                .filter(|r| r.category != event.corrected)
                .map(LearnedRule::key)
                .collect();

            for key in conflicting {
                let Some(rule) = self.rules.adjust(&key, now, |c| c - penalty) else {
                    continue;
                };
                if rule.confidence < self.config.floor {
                    self.rules.remove(&key);
                    self.store.delete(&key).await?;
                    outcome.deleted.push(key);
                } else {
                    self.store.put(&rule).await?;
                    outcome.decayed.push(key);
                }
            }

            let key = RuleKey::new(scope, &pattern, event.corrected.clone());
            let rule = if let Some(rule) = self.rules.adjust(&key, now, |c| self.reinforced(c)) {
                outcome.reinforced.push(key);
                rule
            } else {
                outcome.created.push(key.clone());
                let rule = LearnedRule::new(key, self.config.seed, now);
                self.rules.upsert(rule.clone());
                rule
            };
            self.store.put(&rule).await?;
        }
        Ok(outcome)
    }

    fn reinforced(&self, confidence: f64) -> f64 {
        (confidence + self.config.step)
            .min(self.config.ceiling)
            .clamp(confidence.min(1.0), 1.0)
    }
}

/// Most salient subject keywords: longest first, ties in subject order.
fn salient_keywords(tokens: &[String], k: usize) -> Vec<String> {
    let mut ranked: Vec<&String> = tokens.iter().collect();
    ranked.sort_by_key(|t| std::cmp::Reverse(t.chars().count()));
    ranked.into_iter().take(k).cloned().collect()
}
