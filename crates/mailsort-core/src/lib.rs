//! # mailsort-core
//!
//! Adaptive mail classification engine for `MailSort`.
//!
//! This crate provides:
//! - **Fingerprint Cache** - replays verdicts for mail of a kind already seen
//! - **Learned Rules** - sender, domain and subject keyword rules shaped by user corrections
//! - **Batch Dispatch** - rate-limited, batched calls to a remote classifier
//! - **Heuristic Fallback** - keyword scoring that is always available
//! - **Checkpoint** - crash-safe record of processed items
//! - **Processor** - the polling loop relocating mail between folders

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod cache;
pub mod checkpoint;
pub mod classification;
pub mod config;
pub mod dispatch;
pub mod engine;
mod error;
pub mod fingerprint;
pub mod heuristic;
pub mod learner;
pub mod mail;
pub mod metrics;
pub mod processor;
pub mod rules;
pub mod sieve;
pub mod state;
pub mod taxonomy;

pub use cache::{CacheConfig, CacheEntry, CacheStore};
pub use checkpoint::{Checkpoint, CheckpointConfig, CheckpointState, Placement};
pub use classification::{ClassificationResult, Method};
pub use config::EngineConfig;
pub use dispatch::{
    BatchDispatcher, BatchQueue, ClassifyRequest, DispatchConfig, FewShotExample, RateLimiter,
    RemoteClassifier, RemoteError, RemoteItem, RemoteVerdict,
};
pub use engine::{Engine, EngineBuilder, MaintenanceReport};
pub use error::{Error, Result};
pub use fingerprint::{Features, Fingerprint};
pub use heuristic::{HeuristicConfig, HeuristicScorer};
pub use learner::{CorrectionOutcome, Learner, LearnerConfig};
pub use mail::{ItemId, MailItem, MailStore, MemoryMailStore, ScanScope, StoreError};
pub use metrics::{Metrics, MetricsSnapshot};
pub use processor::{CycleReport, Processor, ProcessorConfig};
pub use rules::{
    CorrectionEvent, LearnedRule, MemoryRuleStore, RuleBook, RuleKey, RuleMatch, RuleScope,
    RuleStore, RulesConfig, SqliteRuleStore,
};
pub use sieve::export_sieve;
pub use state::{CorruptStatePolicy, StateImage};
pub use taxonomy::{Category, CategoryName, Taxonomy};
