//! Batch dispatch to the remote classifier.
//!
//! Items that neither the cache nor the rule book could place are grouped
//! into batches and sent to the remote classifier under a rolling rate
//! budget. Every answer is validated against the taxonomy; anything that
//! does not hold up is re-scored by the heuristic, item by item. A failed,
//! timed-out or abandoned call degrades its whole batch to the heuristic.
//! Nothing on this path is fatal.

mod limiter;
mod queue;
mod remote;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

pub use limiter::RateLimiter;
pub use queue::BatchQueue;
pub use remote::{
    ClassifyRequest, FewShotExample, REMOTE_BODY_CHARS, RemoteClassifier, RemoteError,
    RemoteItem, RemoteVerdict,
};

use crate::cache::CacheStore;
use crate::classification::{ClassificationResult, Method};
use crate::heuristic::HeuristicScorer;
use crate::mail::{ItemId, MailItem};
use crate::metrics::{DEFAULT_COST_PER_CALL, Metrics};
use crate::taxonomy::Taxonomy;

/// Largest batch ever sent in one call.
pub const MAX_BATCH_SIZE: usize = 50;

/// Dispatcher tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Items per remote call, clamped to `1..=50`.
    pub batch_size: usize,
    /// Remote calls allowed per window.
    pub max_calls: usize,
    /// Rolling window length, in seconds.
    pub window_secs: u64,
    /// Timeout of one remote call, in seconds.
    pub call_timeout_secs: u64,
    /// How long the batch queue waits to fill a batch, in milliseconds.
    pub linger_ms: u64,
    /// Estimated cost of one remote call, in dollars.
    pub cost_per_call: f64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_calls: 50,
            window_secs: 60,
            call_timeout_secs: 30,
            linger_ms: 250,
            cost_per_call: DEFAULT_COST_PER_CALL,
        }
    }
}

impl DispatchConfig {
    /// Batch size after clamping.
    #[must_use]
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_BATCH_SIZE)
    }

    /// Per-call timeout.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Rate window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Queue linger.
    #[must_use]
    pub const fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }
}

/// Groups items into rate-limited remote calls.
pub struct BatchDispatcher {
    taxonomy: Arc<Taxonomy>,
    remote: Option<Arc<dyn RemoteClassifier>>,
    limiter: RateLimiter,
    cache: Arc<CacheStore>,
    heuristic: HeuristicScorer,
    metrics: Arc<Metrics>,
    examples: RwLock<Vec<FewShotExample>>,
    config: DispatchConfig,
}

impl std::fmt::Debug for BatchDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchDispatcher")
            .field("remote", &self.remote.is_some())
            .field("limiter", &self.limiter)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BatchDispatcher {
    /// Create a dispatcher. With no remote, every item goes to the heuristic.
    #[must_use]
    pub fn new(
        taxonomy: Arc<Taxonomy>,
        remote: Option<Arc<dyn RemoteClassifier>>,
        cache: Arc<CacheStore>,
        heuristic: HeuristicScorer,
        metrics: Arc<Metrics>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            limiter: RateLimiter::new(config.max_calls, config.window()),
            taxonomy,
            remote,
            cache,
            heuristic,
            metrics,
            examples: RwLock::new(Vec::new()),
            config,
        }
    }

    /// Dispatcher configuration.
    #[must_use]
    pub const fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// The shared rate limiter.
    #[must_use]
    pub const fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Replace the few-shot examples sent with every request.
    pub fn set_examples(&self, examples: Vec<FewShotExample>) {
        *self.examples.write().unwrap_or_else(PoisonError::into_inner) = examples;
    }

    /// Classify `items` remotely in batches, falling back to the heuristic.
    ///
    /// Every item gets a result. Batches that cannot get a rate slot before
    /// `deadline` are scored by the heuristic.
    pub async fn submit(
        &self,
        items: &[MailItem],
        deadline: Option<Instant>,
    ) -> HashMap<ItemId, ClassificationResult> {
        let mut results = HashMap::with_capacity(items.len());
        for batch in items.chunks(self.config.effective_batch_size()) {
            results.extend(self.dispatch_batch(batch, deadline).await);
        }
        results
    }

    /// Heuristic result for one item.
    #[must_use]
    pub fn fallback(&self, item: &MailItem) -> ClassificationResult {
        self.heuristic.classify(item)
    }

    async fn dispatch_batch(
        &self,
        batch: &[MailItem],
        deadline: Option<Instant>,
    ) -> Vec<(ItemId, ClassificationResult)> {
        let Some(remote) = &self.remote else {
            return self.fallback_all(batch);
        };

        if !self.limiter.acquire(deadline).await {
            warn!(items = batch.len(), "rate budget exhausted, using heuristic for batch");
            self.metrics.rate_limited();
            return self.fallback_all(batch);
        }

        let request = ClassifyRequest {
            items: batch.iter().map(RemoteItem::from).collect(),
            vocabulary: self.taxonomy.vocabulary(),
            examples: self
                .examples
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        };

        // The deadline bounds the wait for a slot, never the call itself.
        let timeout = self.config.call_timeout();
        self.metrics.remote_call();
        let verdicts = match tokio::time::timeout(timeout, remote.classify(&request)).await {
            Ok(Ok(verdicts)) => verdicts,
            Ok(Err(e)) => return self.degrade(batch, &e),
            Err(_) => return self.degrade(batch, &RemoteError::Timeout(timeout)),
        };

        batch
            .iter()
            .map(|item| {
                let result = match verdicts.get(&item.id) {
                    Some(verdict) => self.validate(item, verdict),
                    None => {
                        debug!(item = %item.id, "remote omitted item");
                        None
                    }
                };
                let result = result.unwrap_or_else(|| {
                    self.metrics.rejected_label();
                    self.fallback(item)
                });
                (item.id.clone(), result)
            })
            .collect()
    }

    /// Accept a verdict only if it names an assignable category with a
    /// confidence that clears its threshold.
    fn validate(&self, item: &MailItem, verdict: &RemoteVerdict) -> Option<ClassificationResult> {
        let Some(category) = self.taxonomy.resolve(&verdict.label) else {
            debug!(item = %item.id, label = %verdict.label, "rejected unknown label");
            return None;
        };
        if self.taxonomy.is_default(&category)
            || !verdict.confidence.is_finite()
            || !(0.0..=1.0).contains(&verdict.confidence)
            || !self.taxonomy.accepts(&category, verdict.confidence)
        {
            debug!(
                item = %item.id,
                %category,
                confidence = verdict.confidence,
                "rejected remote verdict"
            );
            return None;
        }

        let result = ClassificationResult::new(
            &self.taxonomy,
            item.id.clone(),
            category,
            verdict.confidence,
            Method::BatchRemote,
        );
        self.cache.store(item, &result);
        Some(result)
    }

    fn degrade(
        &self,
        batch: &[MailItem],
        error: &RemoteError,
    ) -> Vec<(ItemId, ClassificationResult)> {
        warn!(%error, items = batch.len(), "remote classification failed, using heuristic");
        self.metrics.remote_failure();
        self.fallback_all(batch)
    }

    fn fallback_all(&self, batch: &[MailItem]) -> Vec<(ItemId, ClassificationResult)> {
        batch
            .iter()
            .map(|item| (item.id.clone(), self.fallback(item)))
            .collect()
    }
}
