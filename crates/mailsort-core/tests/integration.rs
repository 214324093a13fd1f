//! Integration tests for the classification engine.
//!
//! These tests drive the public API with an in-memory mail store and a
//! scripted remote classifier.

#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;

use mailsort_core::{
    CategoryName, ClassifyRequest, DispatchConfig, Engine, EngineConfig, Features, ItemId,
    LearnedRule, MailItem, MailStore, MemoryMailStore, MemoryRuleStore, Method, Processor,
    ProcessorConfig, RemoteClassifier, RemoteError, RemoteVerdict, RuleKey, RuleScope, RuleStore,
    Taxonomy,
};

/// Remote classifier answering by subject.
struct FakeRemote {
    /// Label and confidence per exact subject.
    answers: HashMap<String, (String, f64)>,
    /// Fail every call.
    fail: bool,
    /// When each call was issued.
    calls: Mutex<Vec<Instant>>,
}

impl FakeRemote {
    fn new(answers: &[(&str, &str, f64)]) -> Self {
        Self {
            answers: answers
                .iter()
                .map(|(subject, label, c)| ((*subject).to_string(), ((*label).to_string(), *c)))
                .collect(),
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(&[])
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteClassifier for FakeRemote {
    async fn classify(
        &self,
        request: &ClassifyRequest,
    ) -> Result<HashMap<ItemId, RemoteVerdict>, RemoteError> {
        self.calls.lock().unwrap().push(Instant::now());
        if self.fail {
            return Err(RemoteError::Status {
                status: 503,
                message: "unavailable".into(),
            });
        }
        Ok(request
            .items
            .iter()
            .filter_map(|item| {
                self.answers.get(&item.subject).map(|(label, confidence)| {
                    (
                        item.id.clone(),
                        RemoteVerdict {
                            label: label.clone(),
                            confidence: *confidence,
                        },
                    )
                })
            })
            .collect())
    }
}

async fn engine(remote: &Arc<FakeRemote>) -> Engine {
    Engine::builder(Taxonomy::default())
        .remote(Arc::clone(remote) as Arc<dyn RemoteClassifier>)
        .build()
        .await
        .unwrap()
}

fn sender_key(sender: &str, category: &str) -> RuleKey {
    RuleKey::new(RuleScope::SenderExact, sender, CategoryName::new(category))
}

#[tokio::test]
async fn test_classify_one_idempotent() {
    let remote = Arc::new(FakeRemote::new(&[("Quarterly numbers", "FINANCE", 0.9)]));
    let engine = engine(&remote).await;
    let remote_item = MailItem::new("1", "INBOX", "cfo@corp.test", "Quarterly numbers");
    let local_item = MailItem::new("2", "INBOX", "pal@home.test", "Weekly digest newsletter");

    for item in [&remote_item, &local_item] {
        let first = engine.classify_one(item).await;
        let second = engine.classify_one(item).await;
        assert_eq!(first.category, second.category);
        assert!((first.confidence - second.confidence).abs() < f64::EPSILON);
    }
}

#[tokio::test]
async fn test_sender_rule_beats_domain_rule() {
    let store = Arc::new(MemoryRuleStore::new());
    let now = Utc::now();
    store
        .put(&LearnedRule::new(sender_key("boss@corp.test", "PRO"), 0.8, now))
        .await
        .unwrap();
    store
        .put(&LearnedRule::new(
            RuleKey::new(RuleScope::Domain, "corp.test", CategoryName::new("SHOPPING")),
            0.95,
            now,
        ))
        .await
        .unwrap();
    let engine = Engine::builder(Taxonomy::default())
        .rule_store(store)
        .build()
        .await
        .unwrap();

    let boss = engine
        .classify_one(&MailItem::new("1", "INBOX", "boss@corp.test", "Hello"))
        .await;
    let colleague = engine
        .classify_one(&MailItem::new("2", "INBOX", "desk@corp.test", "Hello"))
        .await;

    assert_eq!(boss.category.as_str(), "PRO");
    assert_eq!(boss.method, Method::Rule);
    assert_eq!(colleague.category.as_str(), "SHOPPING");
}

#[tokio::test]
async fn test_confirming_corrections_never_lower_confidence() {
    let engine = Engine::builder(Taxonomy::default()).build().await.unwrap();
    let item = MailItem::new("1", "INBOX", "boss@corp.test", "Status update");
    let key = sender_key("boss@corp.test", "PRO");

    let mut last = 0.0;
    for i in 0..6 {
        engine
            .observe_correction(
                ItemId::new(format!("c{i}")),
                Some(CategoryName::new("NEWSLETTER")),
                CategoryName::new("PRO"),
                Features::of(&item),
            )
            .await
            .unwrap();
        let confidence = engine.rules().get(&key).unwrap().confidence;
        assert!(confidence >= last);
        assert!(confidence <= 1.0);
        last = confidence;
    }

    engine
        .observe_correction(
            ItemId::new("conflict"),
            Some(CategoryName::new("PRO")),
            CategoryName::new("FINANCE"),
            Features::of(&item),
        )
        .await
        .unwrap();
    let decayed = engine.rules().get(&key).unwrap().confidence;
    assert!(decayed < last);
}

#[tokio::test(start_paused = true)]
async fn test_remote_calls_respect_rolling_budget() {
    let remote = Arc::new(FakeRemote::new(&[]));
    let config = EngineConfig {
        dispatch: DispatchConfig {
            batch_size: 1,
            max_calls: 3,
            window_secs: 60,
            ..DispatchConfig::default()
        },
        ..EngineConfig::default()
    };
    let engine = Engine::builder(Taxonomy::default())
        .config(config)
        .remote(Arc::clone(&remote) as Arc<dyn RemoteClassifier>)
        .build()
        .await
        .unwrap();
    let items: Vec<MailItem> = (0..10)
        .map(|i| MailItem::new(i.to_string(), "INBOX", format!("s{i}@x{i}.test"), format!("Note {i}")))
        .collect();

    let results = engine.classify_batch(&items).await;

    assert_eq!(results.len(), 10);
    let calls = remote.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 10);
    let window = Duration::from_secs(60);
    for start in &calls {
        let in_window = calls
            .iter()
            .filter(|t| **t >= *start && t.duration_since(*start) < window)
            .count();
        assert!(in_window <= 3, "{in_window} calls within one window");
    }
}

#[tokio::test(start_paused = true)]
async fn test_deadline_degrades_instead_of_waiting() {
    let remote = Arc::new(FakeRemote::new(&[]));
    let config = EngineConfig {
        dispatch: DispatchConfig {
            batch_size: 1,
            max_calls: 1,
            window_secs: 60,
            ..DispatchConfig::default()
        },
        ..EngineConfig::default()
    };
    let engine = Engine::builder(Taxonomy::default())
        .config(config)
        .remote(Arc::clone(&remote) as Arc<dyn RemoteClassifier>)
        .build()
        .await
        .unwrap();
    let items: Vec<MailItem> = (0..3)
        .map(|i| MailItem::new(i.to_string(), "INBOX", format!("s{i}@x{i}.test"), format!("Note {i}")))
        .collect();

    let results = engine
        .classify_batch_until(&items, Some(Instant::now() + Duration::from_secs(5)))
        .await;

    assert_eq!(results.len(), 3);
    assert_eq!(remote.call_count(), 1);
    assert_eq!(engine.get_metrics().rate_limited_batches, 2);
}

#[tokio::test]
async fn test_processed_items_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let remote = Arc::new(FakeRemote::new(&[("Invoice #881 due", "FINANCE", 0.88)]));
    let store = Arc::new(MemoryMailStore::new());
    store.insert(MailItem::new("1", "INBOX", "ops@vendor.test", "Invoice #881 due"));

    let first = Arc::new(engine(&remote).await);
    let processor = Processor::new(
        Arc::clone(&first),
        Arc::clone(&store) as Arc<dyn MailStore>,
        ProcessorConfig::default(),
    );
    let (queue, _collector) = first.batch_queue();
    let (_tx, rx) = watch::channel(false);
    processor.run_cycle(&queue, &rx).await;
    first.save_state(&path).unwrap();

    // Put the item back as if the move had not been seen.
    assert!(store.user_move(&ItemId::new("1"), "Folders/Finance", "INBOX"));

    let second = Arc::new(engine(&remote).await);
    assert!(second.load_state(&path).await.unwrap());
    assert!(second.checkpoint().is_processed(&ItemId::new("1")));
    let before = second.get_metrics().classifications;

    let processor = Processor::new(
        Arc::clone(&second),
        Arc::clone(&store) as Arc<dyn MailStore>,
        ProcessorConfig::default(),
    );
    let (queue, _collector) = second.batch_queue();
    let report = processor.run_cycle(&queue, &rx).await;

    assert_eq!(report.skipped, 1);
    assert_eq!(second.get_metrics().classifications, before);
    assert_eq!(store.moves().len(), 1);
}

#[tokio::test]
async fn test_failed_batch_falls_back_for_every_item() {
    let remote = Arc::new(FakeRemote::failing());
    let engine = engine(&remote).await;
    let items: Vec<MailItem> = (0..10)
        .map(|i| MailItem::new(i.to_string(), "INBOX", format!("s{i}@x.test"), format!("Note {i}")))
        .collect();

    let results = engine.classify_batch(&items).await;

    assert_eq!(results.len(), 10);
    for item in &items {
        assert_eq!(results[&item.id].method, Method::Heuristic);
    }
    let metrics = engine.get_metrics();
    assert_eq!(metrics.remote_calls, 1);
    assert_eq!(metrics.remote_failures, 1);
    assert_eq!(metrics.heuristic_fallbacks, 10);
}

#[tokio::test]
async fn test_new_sender_cached_after_remote_verdict() {
    let remote = Arc::new(FakeRemote::new(&[("Invoice #881 due", "FINANCE", 0.88)]));
    let engine = engine(&remote).await;

    let first = engine
        .classify_one(&MailItem::new("1", "INBOX", "ops@vendor.test", "Invoice #881 due"))
        .await;
    let later = engine
        .classify_one(&MailItem::new("2", "INBOX", "ops@vendor.test", "Invoice #881 due"))
        .await;

    assert_eq!(first.category.as_str(), "FINANCE");
    assert_eq!(first.method, Method::BatchRemote);
    assert!((first.confidence - 0.88).abs() < f64::EPSILON);
    assert_eq!(later.category.as_str(), "FINANCE");
    assert_eq!(later.method, Method::Cache);
    assert_eq!(remote.call_count(), 1);
    assert_eq!(engine.cache().len(), 1);
}

#[tokio::test]
async fn test_repeated_corrections_promote_sender_rule() {
    let remote = Arc::new(FakeRemote::new(&[]));
    let engine = engine(&remote).await;
    let key = sender_key("lead@partner.test", "PRO");
    let subjects = ["Roadmap draft", "Sprint planning", "Budget follow-up"];

    for (i, subject) in subjects.iter().enumerate() {
        let item = MailItem::new(format!("c{i}"), "Folders/Work", "Lead <lead@partner.test>", *subject);
        engine
            .observe_correction(
                item.id.clone(),
                Some(CategoryName::new("NEWSLETTER")),
                CategoryName::new("PRO"),
                Features::of(&item),
            )
            .await
            .unwrap();
        if i == 0 {
            let rule = engine.rules().get(&key).unwrap();
            assert!((rule.confidence - 0.75).abs() < 1e-9);
        }
    }

    assert!(engine.rules().get(&key).unwrap().confidence >= 0.9);

    let next = engine
        .classify_one(&MailItem::new("n", "INBOX", "lead@partner.test", "Anything at all"))
        .await;
    assert_eq!(next.category.as_str(), "PRO");
    assert_eq!(next.method, Method::Rule);
    assert_eq!(remote.call_count(), 0);
}

#[tokio::test]
async fn test_rebuild_replays_correction_log() {
    let store = Arc::new(MemoryRuleStore::new());
    let engine = Engine::builder(Taxonomy::default())
        .rule_store(Arc::clone(&store) as Arc<dyn RuleStore>)
        .build()
        .await
        .unwrap();
    let item = MailItem::new("1", "INBOX", "boss@corp.test", "Status update");
    engine
        .observe_correction(item.id.clone(), None, CategoryName::new("PRO"), Features::of(&item))
        .await
        .unwrap();
    let learned = engine.rules().all();

    let replayed = engine.rebuild_rules().await.unwrap();

    assert_eq!(replayed, 1);
    let rebuilt = engine.rules().all();
    assert_eq!(rebuilt.len(), learned.len());
    for (a, b) in learned.iter().zip(&rebuilt) {
        assert_eq!(a.key(), b.key());
        assert!((a.confidence - b.confidence).abs() < f64::EPSILON);
    }
    assert_eq!(store.list().await.unwrap().len(), rebuilt.len());
}

#[tokio::test]
async fn test_sieve_export_lists_confident_rules() {
    let engine = Engine::builder(Taxonomy::default()).build().await.unwrap();
    let item = MailItem::new("1", "INBOX", "boss@corp.test", "Status update");
    for i in 0..3 {
        engine
            .observe_correction(
                ItemId::new(format!("c{i}")),
                None,
                CategoryName::new("PRO"),
                Features::of(&item),
            )
            .await
            .unwrap();
    }

    let script = engine.export_sieve(0.9);

    assert!(script.contains("address :is \"from\" \"boss@corp.test\""));
    assert!(script.contains("fileinto \"Folders/Work\";"));
}
