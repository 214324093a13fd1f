//! Item fingerprints and feature extraction.
//!
//! A fingerprint identifies "the same kind of mail": the same sender with a
//! subject that differs only in numbers, punctuation, reply prefixes or word
//! order. It is the cache key and the source of the features the learner
//! turns into rules.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::mail::MailItem;

/// Maximum number of subject tokens kept per item.
pub const MAX_SUBJECT_TOKENS: usize = 8;

/// Minimum token length, in characters.
const MIN_TOKEN_CHARS: usize = 3;

/// Reply and forward markers stripped from the start of a subject.
const SUBJECT_PREFIXES: &[&str] = &["re", "fwd", "fw", "tr", "aw", "sv", "wg"];

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "you", "your", "with", "from", "this", "that", "are", "was", "have",
    "has", "not", "but", "all", "our", "out", "new", "now", "get", "can", "will", "its", "about",
    "les", "des", "une", "pour", "vous", "votre", "vos", "avec", "dans", "sur", "est", "par",
    "pas", "qui", "que", "aux", "nous",
];

/// Whether `word` is a stop-word.
#[must_use]
pub fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(&word)
}

/// Extract the bare, lower-cased address from a sender header.
///
/// Accepts `Name <addr>`, `<addr>` and bare `addr` forms.
#[must_use]
pub fn normalize_sender(sender: &str) -> String {
    let address = match (sender.rfind('<'), sender.rfind('>')) {
        (Some(start), Some(end)) if start < end => &sender[start + 1..end],
        _ => sender,
    };
    address
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .to_lowercase()
}

/// Domain part of a normalized address, empty if there is none.
#[must_use]
pub fn sender_domain(address: &str) -> String {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain.trim().trim_end_matches('.').to_lowercase())
        .unwrap_or_default()
}

/// Normalized, bounded subject tokens in first-seen order.
///
/// Reply/forward prefixes are removed, only alphabetic runs are kept, short
/// tokens and stop-words are dropped, and duplicates are removed.
#[must_use]
pub fn subject_tokens(subject: &str) -> Vec<String> {
    let lowered = subject.to_lowercase();
    let stripped = strip_prefixes(&lowered);

    let mut seen = HashSet::new();
    stripped
        .split(|c: char| !c.is_alphabetic())
        .filter(|t| t.chars().count() >= MIN_TOKEN_CHARS && !is_stop_word(t))
        .filter(|t| seen.insert(*t))
        .take(MAX_SUBJECT_TOKENS)
        .map(ToString::to_string)
        .collect()
}

/// Remove any chain of `re:`/`fwd:`-style prefixes.
fn strip_prefixes(subject: &str) -> &str {
    let mut rest = subject.trim_start();
    loop {
        let Some((head, tail)) = rest.split_once(':') else {
            return rest;
        };
        let head = head.trim();
        // `Re[2]:` and `RE 3:` style counters
        let word = head.trim_end_matches(|c: char| c.is_ascii_digit() || "[]() ".contains(c));
        if SUBJECT_PREFIXES.contains(&word) {
            rest = tail.trim_start();
        } else {
            return rest;
        }
    }
}

/// Features extracted from an item, shared by the cache key and the learner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    /// Normalized sender address.
    pub sender: String,
    /// Normalized sender domain.
    pub domain: String,
    /// Normalized subject tokens.
    pub subject_tokens: Vec<String>,
}

impl Features {
    /// Extract features from an item.
    #[must_use]
    pub fn of(item: &MailItem) -> Self {
        let sender = item.sender_address();
        let domain = sender_domain(&sender);
        Self {
            sender,
            domain,
            subject_tokens: subject_tokens(&item.subject),
        }
    }
}

/// Deterministic 128-bit item signature, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint an item.
    #[must_use]
    pub fn of(item: &MailItem) -> Self {
        Self::from_features(&Features::of(item))
    }

    /// Fingerprint precomputed features.
    #[must_use]
    pub fn from_features(features: &Features) -> Self {
        let mut tokens: Vec<&str> = features.subject_tokens.iter().map(String::as_str).collect();
        tokens.sort_unstable();

        let mut hasher = Sha256::new();
        hasher.update(features.sender.as_bytes());
        hasher.update(b"|");
        hasher.update(features.domain.as_bytes());
        hasher.update(b"|");
        hasher.update(tokens.join(" ").as_bytes());
        let digest = hasher.finalize();

        let hex = digest[..16].iter().fold(String::with_capacity(32), |mut acc, b| {
            use std::fmt::Write;
            let _ = write!(acc, "{b:02x}");
            acc
        });
        Self(hex)
    }

    /// The hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
