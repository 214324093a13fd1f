//! Mail item models.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint;

/// Maximum number of body characters kept on an item.
pub const MAX_BODY_CHARS: usize = 2000;

/// Stable identifier of a mail item, unique across sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    /// Create a new item ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A pending mail item as listed by the mail store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailItem {
    /// Stable identifier.
    pub id: ItemId,
    /// Folder the item currently lives in.
    pub source: String,
    /// Raw sender (`Name <addr>` or bare address).
    pub sender: String,
    /// Subject line.
    pub subject: String,
    /// Body text, truncated to [`MAX_BODY_CHARS`].
    pub body: String,
    /// Whether the item is unread.
    pub unread: bool,
    /// When the store received the item, if known.
    pub received_at: Option<DateTime<Utc>>,
}

impl MailItem {
    /// Create an unread item with an empty body.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        sender: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            id: ItemId::new(id),
            source: source.into(),
            sender: sender.into(),
            subject: subject.into(),
            body: String::new(),
            unread: true,
            received_at: None,
        }
    }

    /// Set the body, truncating it.
    #[must_use]
    pub fn with_body(mut self, body: &str) -> Self {
        self.body = truncate_chars(body, MAX_BODY_CHARS);
        self
    }

    /// Set the unread flag.
    #[must_use]
    pub const fn with_unread(mut self, unread: bool) -> Self {
        self.unread = unread;
        self
    }

    /// Set the received timestamp.
    #[must_use]
    pub const fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = Some(received_at);
        self
    }

    /// Lower-cased bare sender address.
    #[must_use]
    pub fn sender_address(&self) -> String {
        fingerprint::normalize_sender(&self.sender)
    }

    /// Normalized sender domain, empty when the sender has none.
    #[must_use]
    pub fn sender_domain(&self) -> String {
        fingerprint::sender_domain(&self.sender_address())
    }
}

/// Keep at most `max` characters of `text`.
#[must_use]
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}
