//! Checkpoint data models.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mail::ItemId;
use crate::taxonomy::CategoryName;

/// Where the system last put an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    /// Category the item was classified into.
    pub category: CategoryName,
    /// Folder the item was left in.
    pub folder: String,
    /// When the placement was recorded.
    pub placed_at: DateTime<Utc>,
}

/// Serializable checkpoint image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointState {
    /// Processed item identifiers, oldest first.
    pub processed: Vec<ItemId>,
    /// Last recorded placement per processed item.
    pub placements: BTreeMap<ItemId, Placement>,
    /// Time of the last completed scan per source.
    pub last_seen: BTreeMap<String, DateTime<Utc>>,
    /// Sources whose backlog has been scanned once.
    pub initial_scan_complete: BTreeSet<String>,
}

/// Checkpoint tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Processed identifiers kept; the oldest are pruned first.
    pub max_processed: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_processed: 50_000,
        }
    }
}
