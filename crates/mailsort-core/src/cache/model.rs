//! Cache data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::taxonomy::CategoryName;

/// A remembered classification for one fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Cache key.
    pub fingerprint: Fingerprint,
    /// Normalized sender of the item that created the entry.
    #[serde(default)]
    pub sender: String,
    /// Category assigned the first time.
    pub category: CategoryName,
    /// Confidence assigned the first time.
    pub confidence: f64,
    /// Number of times the entry was replayed.
    pub hit_count: u64,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
    /// When the entry was last created or replayed.
    pub last_used: DateTime<Utc>,
}

impl CacheEntry {
    /// Create an entry used for the first time at `now`.
    #[must_use]
    pub const fn new(
        fingerprint: Fingerprint,
        sender: String,
        category: CategoryName,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            fingerprint,
            sender,
            category,
            confidence,
            hit_count: 0,
            created_at: now,
            last_used: now,
        }
    }

    /// Whether the entry has not been used since `cutoff`.
    #[must_use]
    pub fn idle_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_used < cutoff
    }
}

/// Cache tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries idle for longer than this many days are evicted by maintenance.
    pub idle_horizon_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_horizon_days: 75,
        }
    }
}
