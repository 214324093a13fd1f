//! Rule storage seam.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::model::{CorrectionEvent, LearnedRule, RuleKey};
use crate::Result;

/// Durable home of learned rules and the correction log.
///
/// The rule book holds the working copy; every change the learner makes is
/// written through this trait.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Fetch one rule.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    async fn get(&self, key: &RuleKey) -> Result<Option<LearnedRule>>;

    /// Insert or replace a rule.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written.
    async fn put(&self, rule: &LearnedRule) -> Result<()>;

    /// Delete a rule. Returns `true` if it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written.
    async fn delete(&self, key: &RuleKey) -> Result<bool>;

    /// All rules.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    async fn list(&self) -> Result<Vec<LearnedRule>>;

    /// Append a correction to the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written.
    async fn append_correction(&self, event: &CorrectionEvent) -> Result<()>;

    /// The correction log, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    async fn corrections(&self) -> Result<Vec<CorrectionEvent>>;
}

/// Rule store held in memory.
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    rules: Mutex<BTreeMap<RuleKey, LearnedRule>>,
    corrections: Mutex<Vec<CorrectionEvent>>,
}

impl MemoryRuleStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn get(&self, key: &RuleKey) -> Result<Option<LearnedRule>> {
        Ok(self
            .rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn put(&self, rule: &LearnedRule) -> Result<()> {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(rule.key(), rule.clone());
        Ok(())
    }

    async fn delete(&self, key: &RuleKey) -> Result<bool> {
        Ok(self
            .rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some())
    }

    async fn list(&self) -> Result<Vec<LearnedRule>> {
        Ok(self
            .rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }

    async fn append_correction(&self, event: &CorrectionEvent) -> Result<()> {
        self.corrections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }

    async fn corrections(&self) -> Result<Vec<CorrectionEvent>> {
        Ok(self
            .corrections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}
