//! In-memory mail store.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{ItemId, MailItem, MailStore, ScanScope, StoreError};

/// Mail store holding folders in memory.
///
/// Useful for tests and dry runs. Relocation keeps the item's unread flag
/// and identifier.
#[derive(Debug, Default)]
pub struct MemoryMailStore {
    folders: Mutex<BTreeMap<String, Vec<MailItem>>>,
    moves: Mutex<Vec<(ItemId, String)>>,
}

impl MemoryMailStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an item to its source folder.
    pub fn insert(&self, item: MailItem) {
        self.folders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(item.source.clone())
            .or_default()
            .push(item);
    }

    /// Items currently in `folder`.
    #[must_use]
    pub fn folder(&self, folder: &str) -> Vec<MailItem> {
        self.folders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(folder)
            .cloned()
            .unwrap_or_default()
    }

    /// Every relocation performed, in order.
    #[must_use]
    pub fn moves(&self) -> Vec<(ItemId, String)> {
        self.moves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Move an item as a user would, without recording it as a relocation.
    ///
    /// Returns `false` if the item is not in `from`.
    pub fn user_move(&self, id: &ItemId, from: &str, to: &str) -> bool {
        let mut folders = self.folders.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(items) = folders.get_mut(from) else {
            return false;
        };
        let Some(position) = items.iter().position(|i| &i.id == id) else {
            return false;
        };
        let mut item = items.remove(position);
        item.source = to.to_string();
        folders.entry(to.to_string()).or_default().push(item);
        true
    }
}

#[async_trait]
impl MailStore for MemoryMailStore {
    async fn pending(&self, source: &str, scope: ScanScope) -> Result<Vec<MailItem>, StoreError> {
        let folders = self.folders.lock().unwrap_or_else(PoisonError::into_inner);
        let items = folders.get(source).cloned().unwrap_or_default();
        Ok(match scope {
            ScanScope::Full => items,
            ScanScope::Unseen { .. } => items.into_iter().filter(|i| i.unread).collect(),
        })
    }

    async fn relocate(&self, item: &MailItem, destination: &str) -> Result<(), StoreError> {
        let mut folders = self.folders.lock().unwrap_or_else(PoisonError::into_inner);
        let items = folders
            .get_mut(&item.source)
            .ok_or_else(|| StoreError::FolderNotFound(item.source.clone()))?;
        let position = items
            .iter()
            .position(|i| i.id == item.id)
            .ok_or_else(|| StoreError::ItemNotFound(item.id.clone()))?;
        let mut moved = items.remove(position);
        moved.source = destination.to_string();
        folders
            .entry(destination.to_string())
            .or_default()
            .push(moved);
        drop(folders);

        self.moves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((item.id.clone(), destination.to_string()));
        Ok(())
    }
}
