//! Classification engine.
//!
//! Ties the cache, rule book, learner, dispatcher and checkpoint together
//! behind one handle. Every item is resolved in the same order: fingerprint
//! cache, then learned rules, then the remote classifier in batches, with
//! the heuristic scorer as the guaranteed fallback.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cache::CacheStore;
use crate::checkpoint::{Checkpoint, Placement};
use crate::classification::{ClassificationResult, Method};
use crate::config::EngineConfig;
use crate::dispatch::{BatchDispatcher, BatchQueue, RemoteClassifier};
use crate::fingerprint::Features;
use crate::heuristic::HeuristicScorer;
use crate::learner::{CorrectionOutcome, Learner};
use crate::mail::{ItemId, MailItem};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::rules::{LearnedRule, MemoryRuleStore, RuleBook, RuleKey, RuleStore};
use crate::state::{STATE_VERSION, StateImage};
use crate::taxonomy::{CategoryName, Taxonomy};
use crate::{Result, sieve};

/// What a maintenance pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Cache entries idle beyond the horizon.
    pub evicted_cache: usize,
    /// Rules without activity for too long.
    pub pruned_rules: usize,
    /// Oldest checkpoint ids beyond the bound.
    pub pruned_checkpoint: usize,
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    taxonomy: Taxonomy,
    config: EngineConfig,
    remote: Option<Arc<dyn RemoteClassifier>>,
    rule_store: Option<Arc<dyn RuleStore>>,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("categories", &self.taxonomy.len())
            .field("config", &self.config)
            .field("remote", &self.remote.is_some())
            .field("rule_store", &self.rule_store.is_some())
            .finish()
    }
}

impl EngineBuilder {
    /// Creates a builder for `taxonomy` with default settings, no remote
    /// classifier and an in-memory rule store.
    #[must_use]
    pub fn new(taxonomy: Taxonomy) -> Self {
        Self {
            taxonomy,
            config: EngineConfig::default(),
            remote: None,
            rule_store: None,
        }
    }

    /// Sets the engine configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the remote classifier.
    #[must_use]
    pub fn remote(mut self, remote: Arc<dyn RemoteClassifier>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Sets the durable rule store.
    #[must_use]
    pub fn rule_store(mut self, store: Arc<dyn RuleStore>) -> Self {
        self.rule_store = Some(store);
        self
    }

    /// Builds the engine and loads the stored rules.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule store cannot be read.
    pub async fn build(self) -> Result<Engine> {
        let taxonomy = Arc::new(self.taxonomy);
        let config = self.config;
        let store = self
            .rule_store
            .unwrap_or_else(|| Arc::new(MemoryRuleStore::new()));
        let has_remote = self.remote.is_some();

        let metrics = Arc::new(Metrics::new(config.dispatch.cost_per_call));
        let cache = Arc::new(CacheStore::new(config.cache.clone()));
        let rules = Arc::new(RuleBook::new(Arc::clone(&taxonomy), config.rules.clone()));
        rules.replace_all(store.list().await?);

        let heuristic = HeuristicScorer::new(Arc::clone(&taxonomy), config.heuristic.clone());
        let dispatcher = Arc::new(BatchDispatcher::new(
            Arc::clone(&taxonomy),
            self.remote,
            Arc::clone(&cache),
            heuristic,
            Arc::clone(&metrics),
            config.dispatch.clone(),
        ));
        let learner = Learner::new(
            Arc::clone(&taxonomy),
            Arc::clone(&rules),
            Arc::clone(&store),
            config.learner.clone(),
        );
        let checkpoint = Checkpoint::new(config.checkpoint.clone());

        let engine = Engine {
            taxonomy,
            config,
            cache,
            rules,
            learner,
            dispatcher,
            checkpoint,
            metrics,
            store,
        };
        engine.refresh_examples().await?;

        info!(
            categories = engine.taxonomy.len(),
            rules = engine.rules.len(),
            remote = has_remote,
            "engine ready"
        );
        Ok(engine)
    }
}

/// The classification engine.
pub struct Engine {
    taxonomy: Arc<Taxonomy>,
    config: EngineConfig,
    cache: Arc<CacheStore>,
    rules: Arc<RuleBook>,
    learner: Learner,
    dispatcher: Arc<BatchDispatcher>,
    checkpoint: Checkpoint,
    metrics: Arc<Metrics>,
    store: Arc<dyn RuleStore>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("categories", &self.taxonomy.len())
            .field("cache", &self.cache.len())
            .field("rules", &self.rules.len())
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine builder.
    #[must_use]
    pub fn builder(taxonomy: Taxonomy) -> EngineBuilder {
        EngineBuilder::new(taxonomy)
    }

    /// Classify one item.
    pub async fn classify_one(&self, item: &MailItem) -> ClassificationResult {
        if let Some(result) = self.resolve_locally(item) {
            return result;
        }
        let mut results = self.dispatcher.submit(std::slice::from_ref(item), None).await;
        let result = results
            .remove(&item.id)
            .unwrap_or_else(|| self.dispatcher.fallback(item));
        self.finish(result)
    }

    /// Classify several items, batching those that need the remote
    /// classifier. Waits for rate budget as long as needed.
    pub async fn classify_batch(&self, items: &[MailItem]) -> HashMap<ItemId, ClassificationResult> {
        self.classify_batch_until(items, None).await
    }

    /// Like [`Engine::classify_batch`], but batches that cannot get a rate
    /// slot before `deadline` are scored by the heuristic.
    pub async fn classify_batch_until(
        &self,
        items: &[MailItem],
        deadline: Option<Instant>,
    ) -> HashMap<ItemId, ClassificationResult> {
        let mut results = HashMap::with_capacity(items.len());
        let mut misses = Vec::new();
        for item in items {
            match self.resolve_locally(item) {
                Some(result) => {
                    results.insert(item.id.clone(), result);
                }
                None => misses.push(item.clone()),
            }
        }

        if !misses.is_empty() {
            let mut remote = self.dispatcher.submit(&misses, deadline).await;
            for item in &misses {
                let result = remote
                    .remove(&item.id)
                    .unwrap_or_else(|| self.dispatcher.fallback(item));
                results.insert(item.id.clone(), self.finish(result));
            }
        }

        debug!(items = items.len(), dispatched = misses.len(), "classified batch");
        results
    }

    /// Classify one item, sharing remote batches with other callers of
    /// the same queue.
    pub async fn classify_queued(&self, item: &MailItem, queue: &BatchQueue) -> ClassificationResult {
        if let Some(result) = self.resolve_locally(item) {
            return result;
        }
        let result = queue.classify(item.clone()).await;
        self.finish(result)
    }

    /// Start a batch queue feeding this engine's dispatcher.
    ///
    /// The collector task ends once every clone of the queue is dropped.
    #[must_use]
    pub fn batch_queue(&self) -> (BatchQueue, JoinHandle<()>) {
        BatchQueue::spawn(Arc::clone(&self.dispatcher))
    }

    /// Resolve an item from the cache or the rule book, without any remote
    /// call.
    #[must_use]
    pub fn resolve_locally(&self, item: &MailItem) -> Option<ClassificationResult> {
        if let Some(result) = self.cache.lookup(item) {
            return Some(self.finish(result));
        }
        let found = self.rules.evaluate(item)?;
        debug!(item = %item.id, rule = %found.key, confidence = found.confidence, "rule hit");
        let result = ClassificationResult::new(
            &self.taxonomy,
            item.id.clone(),
            found.key.category,
            found.confidence,
            Method::Rule,
        );
        Some(self.finish(result))
    }

    /// Learn from a correction.
    ///
    /// Cached verdicts from the same sender that disagree with the
    /// correction are forgotten.
    ///
    /// # Errors
    ///
    /// Returns an error if `corrected` is not an assignable category or the
    /// rule store fails.
    pub async fn observe_correction(
        &self,
        item_id: ItemId,
        previous: Option<CategoryName>,
        corrected: CategoryName,
        features: Features,
    ) -> Result<CorrectionOutcome> {
        let sender = features.sender.clone();
        let outcome = self
            .learner
            .observe_correction(item_id, previous, corrected.clone(), features)
            .await?;
        if outcome.ignored {
            return Ok(outcome);
        }

        self.metrics.correction();
        let forgotten = self.cache.invalidate_sender(&sender, &corrected);
        if forgotten > 0 {
            debug!(%sender, forgotten, "dropped contradicted cache entries");
        }
        self.refresh_examples().await?;
        Ok(outcome)
    }

    /// Learn from an item the user filed under `corrected`.
    ///
    /// The previous category is the item's recorded placement, which is then
    /// updated to the item's current folder.
    ///
    /// # Errors
    ///
    /// See [`Engine::observe_correction`].
    pub async fn observe_item_correction(
        &self,
        item: &MailItem,
        corrected: CategoryName,
    ) -> Result<CorrectionOutcome> {
        let previous = self.checkpoint.placement(&item.id).map(|p| p.category);
        self.cache.invalidate(item);
        let outcome = self
            .observe_correction(item.id.clone(), previous, corrected.clone(), Features::of(item))
            .await?;
        self.checkpoint.record_placement(
            &item.id,
            Placement {
                category: corrected,
                folder: item.source.clone(),
                placed_at: Utc::now(),
            },
        );
        Ok(outcome)
    }

    /// Current counters.
    #[must_use]
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Save cache, rules, checkpoint and metrics to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be written.
    pub fn save_state(&self, path: &Path) -> Result<()> {
        StateImage {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            cache: self.cache.entries(),
            rules: self.rules.all(),
            checkpoint: self.checkpoint.snapshot(),
            metrics: self.metrics.snapshot(),
        }
        .save(path)
    }

    /// Restore the image saved at `path`.
    ///
    /// The rule store stays authoritative for which rules exist; the image
    /// only contributes hit statistics, or every rule when the store is
    /// empty. Returns `false` when there was nothing to restore.
    ///
    /// # Errors
    ///
    /// Returns an error if the image is corrupt under the abort policy or
    /// the rule store fails.
    pub async fn load_state(&self, path: &Path) -> Result<bool> {
        let Some(image) = StateImage::load(path, self.config.corrupt_state)? else {
            return Ok(false);
        };

        let stored = self.store.list().await?;
        let rules = if stored.is_empty() {
            for rule in &image.rules {
                self.store.put(rule).await?;
            }
            image.rules
        } else {
            merge_rule_stats(stored, &image.rules)
        };

        self.cache.restore(image.cache, &self.taxonomy);
        self.rules.replace_all(rules);
        self.checkpoint.restore(image.checkpoint);
        self.metrics.restore(&image.metrics);

        info!(
            path = %path.display(),
            saved_at = %image.saved_at,
            cache = self.cache.len(),
            rules = self.rules.len(),
            processed = self.checkpoint.len(),
            "restored state"
        );
        Ok(true)
    }

    /// Evict idle cache entries, prune stale rules and bound the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if pruned rules cannot be deleted from the store.
    pub async fn maintain(&self, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        let evicted_cache = self.cache.evict_idle(now);
        let stale = self.rules.prune_stale(now);
        for rule in &stale {
            self.store.delete(&rule.key()).await?;
        }
        let report = MaintenanceReport {
            evicted_cache,
            pruned_rules: stale.len(),
            pruned_checkpoint: self.checkpoint.prune(),
        };
        if report != MaintenanceReport::default() {
            info!(
                evicted_cache = report.evicted_cache,
                pruned_rules = report.pruned_rules,
                pruned_checkpoint = report.pruned_checkpoint,
                "maintenance"
            );
        }
        Ok(report)
    }

    /// Rebuild all rules from the correction log.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule store fails.
    pub async fn rebuild_rules(&self) -> Result<usize> {
        let replayed = self.learner.rebuild().await?;
        self.refresh_examples().await?;
        Ok(replayed)
    }

    /// Sieve script for confident sender and domain rules.
    #[must_use]
    pub fn export_sieve(&self, min_confidence: f64) -> String {
        sieve::export_sieve(&self.rules.all(), &self.taxonomy, min_confidence)
    }

    /// The category set.
    #[must_use]
    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    /// The processing checkpoint.
    #[must_use]
    pub const fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// The fingerprint cache.
    #[must_use]
    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// The learned rules.
    #[must_use]
    pub fn rules(&self) -> &RuleBook {
        &self.rules
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn finish(&self, result: ClassificationResult) -> ClassificationResult {
        self.metrics.record(result.method);
        result
    }

    async fn refresh_examples(&self) -> Result<()> {
        let examples = if self.config.few_shot_examples == 0 {
            Vec::new()
        } else {
            self.learner.few_shot_examples(self.config.few_shot_examples).await?
        };
        self.dispatcher.set_examples(examples);
        Ok(())
    }
}

/// Carry hit statistics from saved rules over to the stored ones.
fn merge_rule_stats(stored: Vec<LearnedRule>, saved: &[LearnedRule]) -> Vec<LearnedRule> {
    let saved: HashMap<RuleKey, &LearnedRule> = saved.iter().map(|r| (r.key(), r)).collect();
    stored
        .into_iter()
        .map(|mut rule| {
            if let Some(old) = saved.get(&rule.key()) {
                rule.hit_count = rule.hit_count.max(old.hit_count);
                rule.last_hit = rule.last_hit.max(old.last_hit);
            }
            rule
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::Ordering;

    use chrono::Duration;

    use super::*;
    use crate::dispatch::tests::ScriptedRemote;
    use crate::rules::RuleScope;

    async fn engine_with(remote: Arc<ScriptedRemote>) -> Engine {
        Engine::builder(Taxonomy::default())
            .remote(remote)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_remote_verdict_cached_for_same_sender() {
        let remote = Arc::new(ScriptedRemote::new(&[("1", "FINANCE", 0.88)]));
        let engine = engine_with(Arc::clone(&remote)).await;
        let first = MailItem::new("1", "INBOX", "ops@vendor.test", "Invoice #881 due");
        let later = MailItem::new("2", "INBOX", "ops@vendor.test", "Invoice #882 due");

        let result = engine.classify_one(&first).await;
        assert_eq!(result.category.as_str(), "FINANCE");
        assert_eq!(result.method, Method::BatchRemote);

        let replay = engine.classify_one(&later).await;
        assert_eq!(replay.category.as_str(), "FINANCE");
        assert_eq!(replay.method, Method::Cache);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);

        let metrics = engine.get_metrics();
        assert_eq!(metrics.classifications, 2);
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.remote_results, 1);
    }

    #[tokio::test]
    async fn test_classify_one_is_idempotent() {
        let remote = Arc::new(ScriptedRemote::new(&[("1", "PRO", 0.8)]));
        let engine = engine_with(remote).await;
        let item = MailItem::new("1", "INBOX", "boss@corp.test", "Quarterly review");

        let first = engine.classify_one(&item).await;
        let second = engine.classify_one(&item).await;

        assert_eq!(first.category, second.category);
        assert!((first.confidence - second.confidence).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_correction_creates_rule_and_drops_stale_cache() {
        let remote = Arc::new(ScriptedRemote::new(&[("1", "NEWSLETTER", 0.8)]));
        let engine = engine_with(Arc::clone(&remote)).await;
        let item = MailItem::new("1", "INBOX", "boss@corp.test", "Weekly sync notes");

        let result = engine.classify_one(&item).await;
        assert_eq!(result.category.as_str(), "NEWSLETTER");
        engine.checkpoint().mark_processed(&result, "Folders/Newsletters");

        let moved = MailItem {
            source: "Folders/Work".into(),
            ..item.clone()
        };
        let outcome = engine
            .observe_item_correction(&moved, CategoryName::new("PRO"))
            .await
            .unwrap();
        assert!(!outcome.created.is_empty());
        assert!(engine.cache().is_empty());
        assert_eq!(
            engine.checkpoint().placement(&item.id).unwrap().category.as_str(),
            "PRO"
        );

        let again = engine.classify_one(&item).await;
        assert_eq!(again.category.as_str(), "PRO");
        assert_eq!(again.method, Method::Rule);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.get_metrics().corrections, 1);
    }

    #[tokio::test]
    async fn test_save_and_load_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let remote = Arc::new(ScriptedRemote::new(&[("1", "FINANCE", 0.88)]));
        let engine = engine_with(Arc::clone(&remote)).await;
        let item = MailItem::new("1", "INBOX", "ops@vendor.test", "Invoice #881 due");
        let result = engine.classify_one(&item).await;
        engine.checkpoint().mark_processed(&result, "Folders/Finance");
        engine.save_state(&path).unwrap();

        let restarted = engine_with(remote).await;
        assert!(restarted.load_state(&path).await.unwrap());

        assert!(restarted.checkpoint().is_processed(&item.id));
        assert_eq!(restarted.cache().len(), 1);
        assert_eq!(restarted.get_metrics(), engine.get_metrics());
    }

    #[tokio::test]
    async fn test_load_state_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::builder(Taxonomy::default()).build().await.unwrap();

        assert!(!engine.load_state(&dir.path().join("none.json")).await.unwrap());
    }

    #[tokio::test]
    async fn test_build_loads_stored_rules() {
        let store = Arc::new(MemoryRuleStore::new());
        let rule = LearnedRule::new(
            RuleKey::new(RuleScope::SenderExact, "boss@corp.test", CategoryName::new("PRO")),
            0.85,
            Utc::now(),
        );
        store.put(&rule).await.unwrap();

        let engine = Engine::builder(Taxonomy::default())
            .rule_store(store)
            .build()
            .await
            .unwrap();

        let item = MailItem::new("1", "INBOX", "Boss <boss@corp.test>", "Hello");
        let result = engine.resolve_locally(&item).unwrap();
        assert_eq!(result.method, Method::Rule);
        assert_eq!(result.category.as_str(), "PRO");
    }

    #[tokio::test]
    async fn test_maintain_prunes_stale_rules_from_store() {
        let store = Arc::new(MemoryRuleStore::new());
        let old = Utc::now() - Duration::days(400);
        let rule = LearnedRule::new(
            RuleKey::new(RuleScope::Domain, "old.test", CategoryName::new("PRO")),
            0.85,
            old,
        );
        store.put(&rule).await.unwrap();
        let engine = Engine::builder(Taxonomy::default())
            .rule_store(Arc::clone(&store) as Arc<dyn RuleStore>)
            .build()
            .await
            .unwrap();

        let report = engine.maintain(Utc::now()).await.unwrap();

        assert_eq!(report.pruned_rules, 1);
        assert!(engine.rules().is_empty());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[test]
    fn test_merge_keeps_stored_confidence_and_saved_hits() {
        let now = Utc::now();
        let key = RuleKey::new(RuleScope::SenderExact, "a@b.test", CategoryName::new("PRO"));
        let stored = LearnedRule::new(key.clone(), 0.95, now);
        let mut saved = LearnedRule::new(key, 0.85, now);
        saved.hit_count = 7;
        saved.last_hit = Some(now);

        let merged = merge_rule_stats(vec![stored], &[saved]);

        assert_eq!(merged.len(), 1);
        assert!((merged[0].confidence - 0.95).abs() < f64::EPSILON);
        assert_eq!(merged[0].hit_count, 7);
        assert_eq!(merged[0].last_hit, Some(now));
    }
}
