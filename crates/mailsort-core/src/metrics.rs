//! Classification counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::classification::Method;

/// Estimated cost of one remote call, in dollars.
pub const DEFAULT_COST_PER_CALL: f64 = 0.005;

/// Lock-free counters shared by the engine and dispatcher.
#[derive(Debug)]
pub struct Metrics {
    cost_per_call: f64,
    classifications: AtomicU64,
    cache_hits: AtomicU64,
    rule_hits: AtomicU64,
    remote_results: AtomicU64,
    heuristic_fallbacks: AtomicU64,
    remote_calls: AtomicU64,
    remote_failures: AtomicU64,
    rejected_labels: AtomicU64,
    rate_limited_batches: AtomicU64,
    corrections: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new(DEFAULT_COST_PER_CALL)
    }
}

impl Metrics {
    /// Create zeroed counters.
    #[must_use]
    pub const fn new(cost_per_call: f64) -> Self {
        Self {
            cost_per_call,
            classifications: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            rule_hits: AtomicU64::new(0),
            remote_results: AtomicU64::new(0),
            heuristic_fallbacks: AtomicU64::new(0),
            remote_calls: AtomicU64::new(0),
            remote_failures: AtomicU64::new(0),
            rejected_labels: AtomicU64::new(0),
            rate_limited_batches: AtomicU64::new(0),
            corrections: AtomicU64::new(0),
        }
    }

    /// Count a returned classification.
    pub fn record(&self, method: Method) {
        self.classifications.fetch_add(1, Ordering::Relaxed);
        let counter = match method {
            Method::Cache => &self.cache_hits,
            Method::Rule => &self.rule_hits,
            Method::BatchRemote => &self.remote_results,
            Method::Heuristic => &self.heuristic_fallbacks,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an issued remote call.
    pub fn remote_call(&self) {
        self.remote_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed remote call.
    pub fn remote_failure(&self) {
        self.remote_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a remote label rejected for one item.
    pub fn rejected_label(&self) {
        self.rejected_labels.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a batch abandoned because the rate budget was exhausted.
    pub fn rate_limited(&self) {
        self.rate_limited_batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an observed correction.
    pub fn correction(&self) {
        self.corrections.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let classifications = get(&self.classifications);
        let remote_calls = get(&self.remote_calls);

        #[allow(clippy::cast_precision_loss)]
        let (estimated_cost, cost_savings_percent) = {
            let cost = remote_calls as f64 * self.cost_per_call;
            // Baseline is one remote call per classified item
            let savings = if classifications == 0 {
                0.0
            } else {
                (1.0 - remote_calls as f64 / classifications as f64).max(0.0) * 100.0
            };
            (cost, savings)
        };

        MetricsSnapshot {
            classifications,
            cache_hits: get(&self.cache_hits),
            rule_hits: get(&self.rule_hits),
            remote_results: get(&self.remote_results),
            heuristic_fallbacks: get(&self.heuristic_fallbacks),
            remote_calls,
            remote_failures: get(&self.remote_failures),
            rejected_labels: get(&self.rejected_labels),
            rate_limited_batches: get(&self.rate_limited_batches),
            corrections: get(&self.corrections),
            estimated_cost,
            cost_savings_percent,
        }
    }

    /// Reset the counters to a persisted snapshot.
    pub fn restore(&self, snapshot: &MetricsSnapshot) {
        let set = |c: &AtomicU64, v: u64| c.store(v, Ordering::Relaxed);
        set(&self.classifications, snapshot.classifications);
        set(&self.cache_hits, snapshot.cache_hits);
        set(&self.rule_hits, snapshot.rule_hits);
        set(&self.remote_results, snapshot.remote_results);
        set(&self.heuristic_fallbacks, snapshot.heuristic_fallbacks);
        set(&self.remote_calls, snapshot.remote_calls);
        set(&self.remote_failures, snapshot.remote_failures);
        set(&self.rejected_labels, snapshot.rejected_labels);
        set(&self.rate_limited_batches, snapshot.rate_limited_batches);
        set(&self.corrections, snapshot.corrections);
    }
}

/// Serializable copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSnapshot {
    /// Classifications returned.
    pub classifications: u64,
    /// Results replayed from the cache.
    pub cache_hits: u64,
    /// Results from learned rules.
    pub rule_hits: u64,
    /// Results accepted from the remote classifier.
    pub remote_results: u64,
    /// Results from the heuristic scorer.
    pub heuristic_fallbacks: u64,
    /// Remote calls issued.
    pub remote_calls: u64,
    /// Remote calls that failed or timed out.
    pub remote_failures: u64,
    /// Per-item remote answers rejected.
    pub rejected_labels: u64,
    /// Batches abandoned to the heuristic under a deadline.
    pub rate_limited_batches: u64,
    /// Corrections observed.
    pub corrections: u64,
    /// Estimated remote spend, in dollars.
    pub estimated_cost: f64,
    /// Remote calls avoided relative to one call per item, in percent.
    pub cost_savings_percent: f64,
}
