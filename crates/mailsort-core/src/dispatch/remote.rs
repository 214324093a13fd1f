//! Remote classifier collaborator.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::mail::{ItemId, MailItem, truncate_chars};

/// Body characters sent to the remote classifier per item.
pub const REMOTE_BODY_CHARS: usize = 500;

/// Errors from the remote classifier. All of them are recoverable.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Transport failure.
    #[error("Network error: {0}")]
    Network(String),

    /// The call did not finish in time.
    #[error("Remote call timed out after {0:?}")]
    Timeout(Duration),

    /// The service answered with an error status.
    #[error("Remote returned status {status}: {message}")]
    Status {
        /// HTTP-style status code.
        status: u16,
        /// Response excerpt.
        message: String,
    },

    /// The response could not be interpreted.
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// No remote service is configured.
    #[error("Remote classifier not configured")]
    NotConfigured,
}

/// One item as sent to the remote classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteItem {
    /// Item identifier, echoed back in the verdict map.
    pub id: ItemId,
    /// Subject line.
    pub subject: String,
    /// Truncated body.
    pub body: String,
    /// Sender address.
    pub sender: String,
}

impl From<&MailItem> for RemoteItem {
    fn from(item: &MailItem) -> Self {
        Self {
            id: item.id.clone(),
            subject: item.subject.clone(),
            body: truncate_chars(&item.body, REMOTE_BODY_CHARS),
            sender: item.sender_address(),
        }
    }
}

/// A past correction shown to the remote classifier as an example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FewShotExample {
    /// Sender address.
    pub sender: String,
    /// Subject tokens joined by spaces.
    pub subject: String,
    /// Category the user chose.
    pub category: String,
}

/// One batch classification request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifyRequest {
    /// Items to classify.
    pub items: Vec<RemoteItem>,
    /// Labels the classifier may answer with.
    pub vocabulary: Vec<String>,
    /// Optional examples drawn from past corrections.
    pub examples: Vec<FewShotExample>,
}

/// The classifier's raw answer for one item.
///
/// The label is untrusted until validated against the taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteVerdict {
    /// Category label as returned.
    pub label: String,
    /// Confidence as returned.
    pub confidence: f64,
}

/// Batch classification service.
#[async_trait]
pub trait RemoteClassifier: Send + Sync {
    /// Classify a batch, returning a verdict per item identifier.
    ///
    /// Missing identifiers are allowed; those items fall back locally.
    ///
    /// # Errors
    ///
    /// Returns an error if the whole call failed.
    async fn classify(
        &self,
        request: &ClassifyRequest,
    ) -> Result<HashMap<ItemId, RemoteVerdict>, RemoteError>;
}
