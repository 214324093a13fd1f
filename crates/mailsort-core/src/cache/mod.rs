//! Fingerprint cache.
//!
//! Remembers accepted classifications by item fingerprint so that mail of a
//! kind already seen is never sent to the remote classifier again. Lookups
//! refresh the entry's hit count and last-used time; eviction only happens
//! from the maintenance pass.

mod model;

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

pub use model::{CacheConfig, CacheEntry};

use crate::classification::{ClassificationResult, Method};
use crate::fingerprint::Fingerprint;
use crate::mail::MailItem;
use crate::taxonomy::{CategoryName, Taxonomy};

/// Thread-safe fingerprint cache.
#[derive(Debug, Default)]
pub struct CacheStore {
    config: CacheConfig,
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
}

impl CacheStore {
    /// Create an empty cache.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Replay a prior classification of an item of the same kind.
    ///
    /// A hit increments the entry's hit count and refreshes its last-used
    /// time. The result carries [`Method::Cache`].
    #[must_use]
    pub fn lookup(&self, item: &MailItem) -> Option<ClassificationResult> {
        let fingerprint = Fingerprint::of(item);
        let now = Utc::now();

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get_mut(&fingerprint)?;
        entry.hit_count += 1;
        entry.last_used = now;

        debug!(item = %item.id, %fingerprint, category = %entry.category, "cache hit");
        Some(ClassificationResult {
            item_id: item.id.clone(),
            category: entry.category.clone(),
            confidence: entry.confidence,
            method: Method::Cache,
            timestamp: now,
        })
    }

    /// Remember `result` for items like `item`.
    ///
    /// An existing entry for the fingerprint is replaced.
    pub fn store(&self, item: &MailItem, result: &ClassificationResult) {
        let fingerprint = Fingerprint::of(item);
        let entry = CacheEntry::new(
            fingerprint.clone(),
            item.sender_address(),
            result.category.clone(),
            result.confidence,
            result.timestamp,
        );
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fingerprint, entry);
    }

    /// Forget the entry for items like `item`.
    ///
    /// Returns `true` if an entry was removed.
    pub fn invalidate(&self, item: &MailItem) -> bool {
        let fingerprint = Fingerprint::of(item);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&fingerprint)
            .is_some()
    }

    /// Forget every entry created from `sender` whose category is not
    /// `keep`.
    ///
    /// Returns the number of removed entries.
    pub fn invalidate_sender(&self, sender: &str, keep: &CategoryName) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, e| e.sender != sender || &e.category == keep);
        before - entries.len()
    }

    /// Remove entries idle beyond the configured horizon.
    ///
    /// Returns the number of evicted entries.
    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::days(i64::from(self.config.idle_horizon_days));
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| !entry.idle_since(cutoff));
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, "evicted idle cache entries");
        }
        evicted
    }

    /// Copy of all entries, ordered by fingerprint.
    #[must_use]
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        entries
    }

    /// Replace the cache contents with persisted entries.
    ///
    /// Entries whose category is not in `taxonomy` or whose confidence is
    /// out of range are dropped.
    pub fn restore(&self, entries: Vec<CacheEntry>, taxonomy: &Taxonomy) {
        let total = entries.len();
        let restored: HashMap<Fingerprint, CacheEntry> = entries
            .into_iter()
            .filter(|e| taxonomy.contains(&e.category) && (0.0..=1.0).contains(&e.confidence))
            .map(|e| (e.fingerprint.clone(), e))
            .collect();
        if restored.len() < total {
            warn!(
                dropped = total - restored.len(),
                "dropped cache entries not matching the taxonomy"
            );
        }
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = restored;
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn result(taxonomy: &Taxonomy, item: &MailItem, category: &str, confidence: f64) -> ClassificationResult {
        ClassificationResult::new(
            taxonomy,
            item.id.clone(),
            CategoryName::new(category),
            confidence,
            Method::BatchRemote,
        )
    }

    #[test]
    fn test_lookup_replays_and_counts_hits() {
        let taxonomy = Taxonomy::default();
        let cache = CacheStore::new(CacheConfig::default());
        let first = MailItem::new("1", "INBOX", "ops@vendor.test", "Invoice #881 due");
        let later = MailItem::new("2", "INBOX", "ops@vendor.test", "Invoice #882 due");

        assert!(cache.lookup(&first).is_none());
        cache.store(&first, &result(&taxonomy, &first, "FINANCE", 0.88));

        let hit = cache.lookup(&later).unwrap();
        assert_eq!(hit.item_id, later.id);
        assert_eq!(hit.category.as_str(), "FINANCE");
        assert_eq!(hit.method, Method::Cache);
        assert!((hit.confidence - 0.88).abs() < f64::EPSILON);

        let _ = cache.lookup(&later);
        assert_eq!(cache.entries()[0].hit_count, 2);
    }

    #[test]
    fn test_evict_idle_only_removes_old_entries() {
        let taxonomy = Taxonomy::default();
        let cache = CacheStore::new(CacheConfig {
            idle_horizon_days: 10,
        });
        let item = MailItem::new("1", "INBOX", "ops@vendor.test", "Invoice");
        cache.store(&item, &result(&taxonomy, &item, "FINANCE", 0.9));

        assert_eq!(cache.evict_idle(Utc::now() + Duration::days(5)), 0);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.evict_idle(Utc::now() + Duration::days(11)), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lookup_keeps_entry_fresh() {
        let taxonomy = Taxonomy::default();
        let cache = CacheStore::new(CacheConfig {
            idle_horizon_days: 10,
        });
        let item = MailItem::new("1", "INBOX", "ops@vendor.test", "Invoice");
        let mut old = result(&taxonomy, &item, "FINANCE", 0.9);
        old.timestamp = Utc::now() - Duration::days(30);
        cache.store(&item, &old);

        let _ = cache.lookup(&item);
        assert_eq!(cache.evict_idle(Utc::now()), 0);
    }

    #[test]
    fn test_invalidate() {
        let taxonomy = Taxonomy::default();
        let cache = CacheStore::default();
        let item = MailItem::new("1", "INBOX", "ops@vendor.test", "Invoice");
        cache.store(&item, &result(&taxonomy, &item, "FINANCE", 0.9));

        assert!(cache.invalidate(&item));
        assert!(!cache.invalidate(&item));
        assert!(cache.lookup(&item).is_none());
    }

    #[test]
    fn test_invalidate_sender_keeps_matching_category() {
        let taxonomy = Taxonomy::default();
        let cache = CacheStore::default();
        let digest = MailItem::new("1", "INBOX", "boss@corp.test", "Weekly digest");
        let review = MailItem::new("2", "INBOX", "boss@corp.test", "Project review");
        let other = MailItem::new("3", "INBOX", "news@corp.test", "Weekly digest");
        cache.store(&digest, &result(&taxonomy, &digest, "NEWSLETTER", 0.8));
        cache.store(&review, &result(&taxonomy, &review, "PRO", 0.8));
        cache.store(&other, &result(&taxonomy, &other, "NEWSLETTER", 0.8));

        let removed = cache.invalidate_sender("boss@corp.test", &CategoryName::new("PRO"));

        assert_eq!(removed, 1);
        assert!(cache.lookup(&digest).is_none());
        assert!(cache.lookup(&review).is_some());
        assert!(cache.lookup(&other).is_some());
    }

    #[test]
    fn test_restore_drops_unknown_categories() {
        let taxonomy = Taxonomy::default();
        let cache = CacheStore::default();
        let now = Utc::now();
        let item = MailItem::new("1", "INBOX", "ops@vendor.test", "Invoice");
        let other = MailItem::new("2", "INBOX", "x@y.test", "Hello there");

        cache.restore(
            vec![
                CacheEntry::new(
                    Fingerprint::of(&item),
                    item.sender_address(),
                    CategoryName::new("FINANCE"),
                    0.9,
                    now,
                ),
                CacheEntry::new(
                    Fingerprint::of(&other),
                    other.sender_address(),
                    CategoryName::new("CRYPTO"),
                    0.9,
                    now,
                ),
            ],
            &taxonomy,
        );

        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(&other).is_none());
    }
}
