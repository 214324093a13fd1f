//! Maildir++ mail store.
//!
//! `INBOX` is the root of the tree; every other folder `A/B` lives in the
//! sub-directory `.A.B`. A message's identifier is the unique part of its
//! file name, which stays the same when the file moves between folders.
//! A message is unread when its info suffix has no `S` flag.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailparse::{MailHeaderMap, ParsedMail};
use mailsort_core::{MailItem, MailStore, ScanScope, StoreError};
use tracing::{debug, warn};

const INFO_SEPARATOR: &str = ":2,";

/// Mail store over a local Maildir++ tree.
#[derive(Debug, Clone)]
pub struct MaildirStore {
    root: PathBuf,
}

/// A message file found in a folder.
#[derive(Debug, Clone)]
struct Entry {
    path: PathBuf,
    unique: String,
    flags: String,
}

impl Entry {
    fn from_path(path: PathBuf) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_string();
        if name.starts_with('.') {
            return None;
        }
        let (unique, flags) = match name.split_once(INFO_SEPARATOR) {
            Some((unique, flags)) => (unique.to_string(), flags.to_string()),
            None => (name, String::new()),
        };
        Some(Self {
            path,
            unique,
            flags,
        })
    }

    fn unread(&self) -> bool {
        !self.flags.contains('S')
    }

    fn file_name(&self) -> String {
        format!("{}{INFO_SEPARATOR}{}", self.unique, self.flags)
    }
}

impl MaildirStore {
    /// Creates a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory of `folder`.
    #[must_use]
    pub fn folder_path(&self, folder: &str) -> PathBuf {
        if folder.eq_ignore_ascii_case("INBOX") {
            self.root.clone()
        } else {
            self.root.join(format!(".{}", folder.replace('/', ".")))
        }
    }

    async fn entries(&self, folder: &str) -> Result<Vec<Entry>, StoreError> {
        let dir = self.folder_path(folder);
        if !tokio::fs::try_exists(dir.join("cur")).await.unwrap_or(false) {
            return Err(StoreError::FolderNotFound(folder.to_string()));
        }

        let mut entries = Vec::new();
        for sub in ["new", "cur"] {
            let mut listing = match tokio::fs::read_dir(dir.join(sub)).await {
                Ok(listing) => listing,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::Operation(e.to_string())),
            };
            while let Some(file) = listing
                .next_entry()
                .await
                .map_err(|e| StoreError::Operation(e.to_string()))?
            {
                if let Some(entry) = Entry::from_path(file.path()) {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    async fn read_item(&self, folder: &str, entry: &Entry) -> Option<MailItem> {
        let bytes = match tokio::fs::read(&entry.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %entry.path.display(), error = %e, "could not read message");
                return None;
            }
        };
        match parse_message(&entry.unique, folder, &bytes) {
            Ok(item) => Some(item.with_unread(entry.unread())),
            Err(e) => {
                warn!(path = %entry.path.display(), error = %e, "could not parse message");
                None
            }
        }
    }
}

#[async_trait]
impl MailStore for MaildirStore {
    async fn pending(&self, source: &str, scope: ScanScope) -> Result<Vec<MailItem>, StoreError> {
        let mut items = Vec::new();
        for entry in self.entries(source).await? {
            if matches!(scope, ScanScope::Unseen { .. }) && !entry.unread() {
                continue;
            }
            if let Some(item) = self.read_item(source, &entry).await {
                items.push(item);
            }
        }
        debug!(%source, ?scope, items = items.len(), "listed maildir folder");
        Ok(items)
    }

    async fn relocate(&self, item: &MailItem, destination: &str) -> Result<(), StoreError> {
        let entry = self
            .entries(&item.source)
            .await?
            .into_iter()
            .find(|e| e.unique == item.id.as_str())
            .ok_or_else(|| StoreError::ItemNotFound(item.id.clone()))?;

        let target = self.folder_path(destination);
        for sub in ["cur", "new", "tmp"] {
            tokio::fs::create_dir_all(target.join(sub))
                .await
                .map_err(|e| StoreError::Operation(e.to_string()))?;
        }
        let to = target.join("cur").join(entry.file_name());
        tokio::fs::rename(&entry.path, &to)
            .await
            .map_err(|e| StoreError::Operation(e.to_string()))?;

        debug!(item = %item.id, from = %entry.path.display(), to = %to.display(), "moved message");
        Ok(())
    }
}

/// Build a [`MailItem`] from a raw RFC 5322 message.
///
/// # Errors
///
/// Returns an error if the message cannot be parsed.
pub fn parse_message(
    id: &str,
    folder: &str,
    raw: &[u8],
) -> Result<MailItem, mailparse::MailParseError> {
    let mail = mailparse::parse_mail(raw)?;
    let header = |name: &str| mail.headers.get_first_value(name).unwrap_or_default();

    let mut item = MailItem::new(id, folder, header("From"), header("Subject"))
        .with_body(&text_body(&mail));
    if let Some(received_at) = mail
        .headers
        .get_first_value("Date")
        .and_then(|date| mailparse::dateparse(&date).ok())
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
    {
        item = item.with_received_at(received_at);
    }
    Ok(item)
}

/// First non-empty text part, preferring the message's own body.
fn text_body(mail: &ParsedMail<'_>) -> String {
    if mail.subparts.is_empty() {
        if mail.ctype.mimetype.starts_with("text/") {
            return mail.get_body().unwrap_or_default();
        }
        return String::new();
    }
    mail.subparts
        .iter()
        .filter(|p| p.ctype.mimetype == "text/plain")
        .chain(mail.subparts.iter())
        .map(text_body)
        .find(|body| !body.trim().is_empty())
        .unwrap_or_default()
}

/// Whether `root` looks like a Maildir.
#[must_use]
pub fn is_maildir(root: &Path) -> bool {
    root.join("cur").is_dir()
}
