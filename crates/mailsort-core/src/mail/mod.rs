//! Mail store collaborator.
//!
//! The engine never talks to a mail server directly. It lists pending items
//! and requests relocations through the [`MailStore`] trait; connection
//! handling, folder naming and folder creation belong to the implementor.

mod memory;
mod model;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryMailStore;
pub use model::{ItemId, MAX_BODY_CHARS, MailItem, truncate_chars};

/// Errors reported by a mail store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Could not reach the store.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The folder does not exist.
    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    /// The item is no longer where it was listed.
    #[error("Item not found: {0}")]
    ItemNotFound(ItemId),

    /// Operation failed.
    #[error("Operation failed: {0}")]
    Operation(String),
}

/// Which items of a source to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanScope {
    /// Every item, used until a source's initial scan has completed.
    Full,
    /// Unread items only.
    Unseen {
        /// Time of the last completed scan of this source, if any.
        since: Option<DateTime<Utc>>,
    },
}

/// Folder-based mail store.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// List items of `source` matching `scope`.
    ///
    /// # Errors
    ///
    /// Returns an error if the folder cannot be listed.
    async fn pending(&self, source: &str, scope: ScanScope) -> Result<Vec<MailItem>, StoreError>;

    /// Move `item` to `destination`, preserving its unread flag.
    ///
    /// Returning `Ok` acknowledges that the move is durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the move was not performed.
    async fn relocate(&self, item: &MailItem, destination: &str) -> Result<(), StoreError>;
}
