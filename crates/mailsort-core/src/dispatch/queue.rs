//! Shared pending queue feeding the dispatcher.
//!
//! Concurrent workers each submit one item and await its result. A single
//! collector task groups submissions into batches, waiting at most the
//! configured linger for a batch to fill.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::BatchDispatcher;
use crate::classification::ClassificationResult;
use crate::mail::MailItem;

struct Pending {
    item: MailItem,
    reply: oneshot::Sender<ClassificationResult>,
}

/// Handle used by workers to enqueue items for batch classification.
///
/// Cloning is cheap. The collector stops once every handle is dropped,
/// after dispatching whatever is still queued.
#[derive(Clone)]
pub struct BatchQueue {
    tx: mpsc::Sender<Pending>,
    dispatcher: Arc<BatchDispatcher>,
}

impl BatchQueue {
    /// Start a collector task for `dispatcher`.
    #[must_use]
    pub fn spawn(dispatcher: Arc<BatchDispatcher>) -> (Self, JoinHandle<()>) {
        let batch_size = dispatcher.config().effective_batch_size();
        let (tx, rx) = mpsc::channel(batch_size * 4);
        let handle = tokio::spawn(collect(Arc::clone(&dispatcher), rx));
        (Self { tx, dispatcher }, handle)
    }

    /// Classify one item as part of the next batch.
    ///
    /// Falls back to the heuristic if the collector is gone.
    pub async fn classify(&self, item: MailItem) -> ClassificationResult {
        let (reply, rx) = oneshot::channel();
        let pending = Pending {
            item: item.clone(),
            reply,
        };
        if self.tx.send(pending).await.is_err() {
            warn!(item = %item.id, "batch queue closed, using heuristic");
            return self.dispatcher.fallback(&item);
        }
        rx.await.unwrap_or_else(|_| {
            warn!(item = %item.id, "batch collector dropped a pending item");
            self.dispatcher.fallback(&item)
        })
    }
}

async fn collect(dispatcher: Arc<BatchDispatcher>, mut rx: mpsc::Receiver<Pending>) {
    let batch_size = dispatcher.config().effective_batch_size();
    let linger = dispatcher.config().linger();

    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        let timer = tokio::time::sleep(linger);
        tokio::pin!(timer);

        while batch.len() < batch_size {
            tokio::select! {
                next = rx.recv() => match next {
                    Some(pending) => batch.push(pending),
                    None => break,
                },
                () = &mut timer => break,
            }
        }

        debug!(items = batch.len(), "dispatching queued batch");
        let items: Vec<MailItem> = batch.iter().map(|p| p.item.clone()).collect();
        let mut results = dispatcher.submit(&items, None).await;

        for pending in batch {
            let result = results
                .remove(&pending.item.id)
                .unwrap_or_else(|| dispatcher.fallback(&pending.item));
            // Worker may have given up during shutdown
            let _ = pending.reply.send(result);
        }
    }
    debug!("batch queue drained");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::cache::CacheStore;
    use crate::classification::Method;
    use crate::dispatch::DispatchConfig;
    use crate::dispatch::tests::ScriptedRemote;
    use crate::heuristic::{HeuristicConfig, HeuristicScorer};
    use crate::metrics::Metrics;
    use crate::taxonomy::Taxonomy;

    fn dispatcher(remote: Arc<ScriptedRemote>, config: DispatchConfig) -> Arc<BatchDispatcher> {
        let taxonomy = Arc::new(Taxonomy::default());
        Arc::new(BatchDispatcher::new(
            Arc::clone(&taxonomy),
            Some(remote),
            Arc::new(CacheStore::default()),
            HeuristicScorer::new(taxonomy, HeuristicConfig::default()),
            Arc::new(Metrics::default()),
            config,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_items_share_batches() {
        let answers: Vec<(String, String, f64)> = (0..6)
            .map(|i| (i.to_string(), "PRO".to_string(), 0.9))
            .collect();
        let borrowed: Vec<(&str, &str, f64)> = answers
            .iter()
            .map(|(id, label, c)| (id.as_str(), label.as_str(), *c))
            .collect();
        let remote = Arc::new(ScriptedRemote::new(&borrowed));
        let config = DispatchConfig {
            batch_size: 3,
            ..DispatchConfig::default()
        };
        let (queue, collector) = BatchQueue::spawn(dispatcher(Arc::clone(&remote), config));

        let mut workers = tokio::task::JoinSet::new();
        for i in 0..6 {
            let queue = queue.clone();
            workers.spawn(async move {
                let item = MailItem::new(i.to_string(), "INBOX", "a@b.test", "Status");
                queue.classify(item).await
            });
        }

        let mut results = Vec::new();
        while let Some(result) = workers.join_next().await {
            results.push(result.unwrap());
        }
        drop(queue);
        collector.await.unwrap();

        assert_eq!(results.len(), 6);
        assert!(results.iter().all(|r| r.method == Method::BatchRemote));
        assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_linger_flushes_partial_batch() {
        let remote = Arc::new(ScriptedRemote::new(&[("1", "PRO", 0.9)]));
        let (queue, _collector) =
            BatchQueue::spawn(dispatcher(Arc::clone(&remote), DispatchConfig::default()));

        let start = tokio::time::Instant::now();
        let result = queue
            .classify(MailItem::new("1", "INBOX", "a@b.test", "Status"))
            .await;

        assert_eq!(result.category.as_str(), "PRO");
        assert!(start.elapsed() >= Duration::from_millis(250));
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
    }
}
