//! Processing checkpoint.
//!
//! Records which items have been durably handled so a restarted loop never
//! handles them again, even if they would now classify differently. An item
//! is marked only after its relocation was acknowledged by the mail store.
//! The checkpoint also keeps each item's last placement, which is what
//! correction detection compares against.

mod model;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

pub use model::{CheckpointConfig, CheckpointState, Placement};

use crate::classification::ClassificationResult;
use crate::mail::ItemId;

#[derive(Debug, Default)]
struct Inner {
    order: VecDeque<ItemId>,
    processed: HashSet<ItemId>,
    placements: HashMap<ItemId, Placement>,
    last_seen: HashMap<String, DateTime<Utc>>,
    scanned: HashSet<String>,
}

impl Inner {
    fn prune_to(&mut self, max: usize) -> usize {
        let mut pruned = 0;
        while self.order.len() > max {
            if let Some(oldest) = self.order.pop_front() {
                self.processed.remove(&oldest);
                self.placements.remove(&oldest);
                pruned += 1;
            }
        }
        pruned
    }
}

/// Thread-safe processing checkpoint.
#[derive(Debug, Default)]
pub struct Checkpoint {
    config: CheckpointConfig,
    inner: RwLock<Inner>,
}

impl Checkpoint {
    /// Create an empty checkpoint.
    #[must_use]
    pub fn new(config: CheckpointConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Whether the item was already handled.
    #[must_use]
    pub fn is_processed(&self, id: &ItemId) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .processed
            .contains(id)
    }

    /// Record that the item was handled and left in `folder`.
    ///
    /// Marking an item twice only refreshes its placement.
    pub fn mark_processed(&self, result: &ClassificationResult, folder: &str) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.processed.insert(result.item_id.clone()) {
            inner.order.push_back(result.item_id.clone());
        }
        inner.placements.insert(
            result.item_id.clone(),
            Placement {
                category: result.category.clone(),
                folder: folder.to_string(),
                placed_at: Utc::now(),
            },
        );
        inner.prune_to(self.config.max_processed);
    }

    /// Last recorded placement of a processed item.
    #[must_use]
    pub fn placement(&self, id: &ItemId) -> Option<Placement> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .placements
            .get(id)
            .cloned()
    }

    /// Replace the placement of a processed item.
    ///
    /// Ignored for items that are not marked processed.
    pub fn record_placement(&self, id: &ItemId, placement: Placement) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.processed.contains(id) {
            inner.placements.insert(id.clone(), placement);
        }
    }

    /// Record a completed scan of `source`.
    pub fn mark_scanned(&self, source: &str, at: DateTime<Utc>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .last_seen
            .insert(source.to_string(), at);
    }

    /// Time of the last completed scan of `source`.
    #[must_use]
    pub fn last_seen(&self, source: &str) -> Option<DateTime<Utc>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_seen
            .get(source)
            .copied()
    }

    /// Whether the backlog of `source` has been scanned once.
    #[must_use]
    pub fn initial_scan_complete(&self, source: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .scanned
            .contains(source)
    }

    /// Flag the backlog of `source` as scanned.
    pub fn complete_initial_scan(&self, source: &str) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .scanned
            .insert(source.to_string());
    }

    /// Consistent copy of the whole checkpoint.
    #[must_use]
    pub fn snapshot(&self) -> CheckpointState {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        CheckpointState {
            processed: inner.order.iter().cloned().collect(),
            placements: inner
                .placements
                .iter()
                .map(|(id, p)| (id.clone(), p.clone()))
                .collect(),
            last_seen: inner
                .last_seen
                .iter()
                .map(|(s, t)| (s.clone(), *t))
                .collect(),
            initial_scan_complete: inner.scanned.iter().cloned().collect(),
        }
    }

    /// Replace the checkpoint with a persisted image.
    pub fn restore(&self, state: CheckpointState) {
        let mut fresh = Inner::default();
        for id in state.processed {
            if fresh.processed.insert(id.clone()) {
                fresh.order.push_back(id);
            }
        }
        fresh.placements = state
            .placements
            .into_iter()
            .filter(|(id, _)| fresh.processed.contains(id))
            .collect();
        fresh.last_seen = state.last_seen.into_iter().collect();
        fresh.scanned = state.initial_scan_complete.into_iter().collect();
        fresh.prune_to(self.config.max_processed);

        debug!(processed = fresh.order.len(), "restored checkpoint");
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = fresh;
    }

    /// Drop the oldest processed items beyond the configured bound.
    ///
    /// Returns the number of pruned items.
    pub fn prune(&self) -> usize {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .prune_to(self.config.max_processed)
    }

    /// Number of processed items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .len()
    }

    /// Whether nothing has been processed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
