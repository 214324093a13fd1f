//! Polling loop.
//!
//! Each cycle first looks for user corrections in the category folders,
//! then scans every source folder. All new items of a source are classified
//! together, so their remote misses share batches; a bounded pool of
//! workers then relocates each item and only then marks it processed.
//! Cancellation arrives on a `watch` channel: no new items are started,
//! pending classifications get a grace period, started relocations finish,
//! and the state is saved.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::classification::ClassificationResult;
use crate::dispatch::BatchQueue;
use crate::engine::Engine;
use crate::mail::{MailItem, MailStore, ScanScope};
use crate::Result;

/// Polling loop tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Folders scanned for new mail.
    pub sources: Vec<String>,
    /// Items handled concurrently.
    pub workers: usize,
    /// Items taken from one source per cycle, most recent first.
    pub max_items_per_source: usize,
    /// Log intended moves without relocating or marking anything.
    pub dry_run: bool,
    /// Pause between cycles, in seconds.
    pub poll_interval_secs: u64,
    /// Save the state every this many cycles (0 only saves on shutdown).
    pub snapshot_every: u32,
    /// Run maintenance every this many cycles (0 disables it).
    pub maintenance_every: u32,
    /// Time in-flight items get to finish after shutdown, in seconds.
    pub shutdown_grace_secs: u64,
    /// Where the state image is saved.
    pub state_path: Option<PathBuf>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            sources: vec!["INBOX".to_string()],
            workers: 4,
            max_items_per_source: 100,
            dry_run: false,
            poll_interval_secs: 300,
            snapshot_every: 1,
            maintenance_every: 24,
            shutdown_grace_secs: 10,
            state_path: None,
        }
    }
}

impl ProcessorConfig {
    /// Pause between cycles.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Shutdown grace period.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Corrections reported to the learner.
    pub corrections: usize,
    /// Items relocated to a category folder.
    pub moved: usize,
    /// Items left where they were.
    pub kept: usize,
    /// Items whose relocation failed; they are retried next cycle.
    pub failed: usize,
    /// Items already processed.
    pub skipped: usize,
    /// Items classified in dry-run mode.
    pub dry_run: usize,
    /// The cycle stopped early because of shutdown.
    pub interrupted: bool,
}

impl CycleReport {
    fn absorb(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Moved => self.moved += 1,
            ItemOutcome::Kept => self.kept += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::DryRun => self.dry_run += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Moved,
    Kept,
    Failed,
    DryRun,
}

/// Drives the engine over a mail store.
pub struct Processor {
    engine: Arc<Engine>,
    store: Arc<dyn MailStore>,
    config: ProcessorConfig,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("engine", &self.engine)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Processor {
    /// Create a processor.
    #[must_use]
    pub fn new(engine: Arc<Engine>, store: Arc<dyn MailStore>, config: ProcessorConfig) -> Self {
        Self {
            engine,
            store,
            config,
        }
    }

    /// Processor configuration.
    #[must_use]
    pub const fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Poll until `shutdown` turns `true` or its sender is dropped, then
    /// save the state.
    ///
    /// # Errors
    ///
    /// Returns an error if the final state save fails.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let (queue, collector) = self.engine.batch_queue();
        let mut cycles: u64 = 0;

        info!(
            sources = ?self.config.sources,
            workers = self.config.workers,
            dry_run = self.config.dry_run,
            "processor started"
        );

        while !shutdown_requested(&shutdown) {
            let report = self.run_cycle(&queue, &shutdown).await;
            cycles += 1;

            let metrics = self.engine.get_metrics();
            info!(
                cycle = cycles,
                moved = report.moved,
                kept = report.kept,
                failed = report.failed,
                skipped = report.skipped,
                corrections = report.corrections,
                classifications = metrics.classifications,
                remote_calls = metrics.remote_calls,
                estimated_cost = metrics.estimated_cost,
                savings_percent = metrics.cost_savings_percent,
                "cycle complete"
            );
            if report.interrupted {
                break;
            }

            if every(cycles, self.config.maintenance_every) {
                if let Err(e) = self.engine.maintain(Utc::now()).await {
                    warn!(error = %e, "maintenance failed");
                }
            }
            if every(cycles, self.config.snapshot_every) {
                if let Err(e) = self.save() {
                    error!(error = %e, "periodic state save failed");
                }
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval()) => {}
                _ = shutdown.changed() => {}
            }
        }

        drop(queue);
        if tokio::time::timeout(self.config.shutdown_grace(), collector)
            .await
            .is_err()
        {
            warn!("batch collector did not stop within the grace period");
        }

        self.save()?;
        info!(cycles, "processor stopped");
        Ok(())
    }

    /// Run one cycle: correction scan, then every source.
    pub async fn run_cycle(
        &self,
        queue: &BatchQueue,
        shutdown: &watch::Receiver<bool>,
    ) -> CycleReport {
        let mut report = CycleReport {
            corrections: self.scan_corrections().await,
            ..CycleReport::default()
        };

        for source in &self.config.sources {
            if shutdown_requested(shutdown) {
                report.interrupted = true;
                break;
            }
            if !self.process_source(source, queue, shutdown, &mut report).await {
                report.interrupted = true;
                break;
            }
        }
        report
    }

    /// Report items the user moved into another category folder.
    ///
    /// Only items with a recorded placement count; a move out of the folder
    /// the item was placed in is the signal.
    pub async fn scan_corrections(&self) -> usize {
        let taxonomy = self.engine.taxonomy();
        let mut corrections = 0;

        for category in taxonomy.assignable() {
            let Some(folder) = category.folder.as_deref() else {
                continue;
            };
            let items = match self.store.pending(folder, ScanScope::Full).await {
                Ok(items) => items,
                Err(e) => {
                    debug!(%folder, error = %e, "skipping correction scan");
                    continue;
                }
            };

            for item in items {
                let Some(placement) = self.engine.checkpoint().placement(&item.id) else {
                    continue;
                };
                if placement.folder == folder || placement.category == category.name {
                    continue;
                }
                match self
                    .engine
                    .observe_item_correction(&item, category.name.clone())
                    .await
                {
                    Ok(outcome) if !outcome.ignored => corrections += 1,
                    Ok(_) => {}
                    Err(e) => warn!(item = %item.id, error = %e, "could not learn from correction"),
                }
            }
        }
        corrections
    }

    /// Returns `false` when interrupted by shutdown.
    async fn process_source(
        &self,
        source: &str,
        queue: &BatchQueue,
        shutdown: &watch::Receiver<bool>,
        report: &mut CycleReport,
    ) -> bool {
        let checkpoint = self.engine.checkpoint();
        let started = Utc::now();
        let initial = !checkpoint.initial_scan_complete(source);
        let scope = if initial {
            ScanScope::Full
        } else {
            ScanScope::Unseen {
                since: checkpoint.last_seen(source),
            }
        };

        let mut items = match self.store.pending(source, scope).await {
            Ok(items) => items,
            Err(e) => {
                warn!(%source, error = %e, "could not list source");
                return true;
            }
        };
        items.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        items.truncate(self.config.max_items_per_source);

        let before = items.len();
        items.retain(|item| !checkpoint.is_processed(&item.id));
        report.skipped += before - items.len();
        debug!(%source, ?scope, pending = items.len(), "scanning source");

        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut classifying = JoinSet::new();
        let mut relocating = JoinSet::new();
        let mut watcher = shutdown.clone();
        let mut interrupted = false;

        // Classification holds no worker permit, so every miss of this
        // source can share a remote batch.
        for item in items {
            if shutdown_requested(&watcher) {
                interrupted = true;
                break;
            }
            let engine = Arc::clone(&self.engine);
            let queue = queue.clone();
            classifying.spawn(async move {
                let result = engine.classify_queued(&item, &queue).await;
                (item, result)
            });
        }

        if !self
            .drain_classified(&mut classifying, &mut relocating, &semaphore, &mut watcher, report)
            .await
        {
            interrupted = true;
        }

        // Started relocations always run to completion, so an item is never
        // moved without its placement being recorded.
        while let Some(joined) = relocating.join_next().await {
            absorb(report, joined);
        }

        if !interrupted && !self.config.dry_run {
            checkpoint.mark_scanned(source, started);
            if initial {
                checkpoint.complete_initial_scan(source);
                info!(%source, "initial scan complete");
            }
        }
        !interrupted
    }

    /// Hand classified items to the relocation pool as they finish. After
    /// shutdown, pending classifications get the grace period and are then
    /// aborted. Returns `false` when shutdown cut the wait short.
    async fn drain_classified(
        &self,
        classifying: &mut JoinSet<(MailItem, ClassificationResult)>,
        relocating: &mut JoinSet<ItemOutcome>,
        semaphore: &Arc<Semaphore>,
        shutdown: &mut watch::Receiver<bool>,
        report: &mut CycleReport,
    ) -> bool {
        while !classifying.is_empty() {
            if shutdown_requested(shutdown) {
                let grace = self.config.shutdown_grace();
                let finished = tokio::time::timeout(grace, async {
                    while let Some(joined) = classifying.join_next().await {
                        self.start_relocation(relocating, semaphore, joined, report);
                    }
                })
                .await;
                if finished.is_err() {
                    warn!(in_flight = classifying.len(), "aborting items after shutdown grace");
                    classifying.abort_all();
                    while classifying.join_next().await.is_some() {}
                }
                return false;
            }

            tokio::select! {
                joined = classifying.join_next() => {
                    if let Some(joined) = joined {
                        self.start_relocation(relocating, semaphore, joined, report);
                    }
                }
                _ = shutdown.changed() => {}
            }
        }
        true
    }

    fn start_relocation(
        &self,
        relocating: &mut JoinSet<ItemOutcome>,
        semaphore: &Arc<Semaphore>,
        joined: std::result::Result<(MailItem, ClassificationResult), JoinError>,
        report: &mut CycleReport,
    ) {
        let (item, result) = match joined {
            Ok(classified) => classified,
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                error!(error = %e, "classification worker panicked");
                report.failed += 1;
                return;
            }
        };

        let engine = Arc::clone(&self.engine);
        let store = Arc::clone(&self.store);
        let semaphore = Arc::clone(semaphore);
        let dry_run = self.config.dry_run;
        relocating.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return ItemOutcome::Failed;
            };
            place_item(&engine, store.as_ref(), &item, &result, dry_run).await
        });
    }

    fn save(&self) -> Result<()> {
        match &self.config.state_path {
            Some(path) => self.engine.save_state(path),
            None => Ok(()),
        }
    }
}

async fn place_item(
    engine: &Engine,
    store: &dyn MailStore,
    item: &MailItem,
    result: &ClassificationResult,
    dry_run: bool,
) -> ItemOutcome {
    let destination = engine
        .taxonomy()
        .folder(&result.category)
        .filter(|folder| *folder != item.source)
        .map(str::to_string);

    if dry_run {
        info!(
            item = %item.id,
            category = %result.category,
            confidence = result.confidence,
            method = %result.method,
            destination = destination.as_deref().unwrap_or("-"),
            "dry run"
        );
        return ItemOutcome::DryRun;
    }

    let Some(destination) = destination else {
        engine.checkpoint().mark_processed(result, &item.source);
        return ItemOutcome::Kept;
    };
    if let Err(e) = store.relocate(item, &destination).await {
        warn!(item = %item.id, %destination, error = %e, "relocation failed");
        return ItemOutcome::Failed;
    }
    engine.checkpoint().mark_processed(result, &destination);
    debug!(
        item = %item.id,
        category = %result.category,
        method = %result.method,
        %destination,
        "relocated"
    );
    ItemOutcome::Moved
}

fn absorb(report: &mut CycleReport, joined: std::result::Result<ItemOutcome, JoinError>) {
    match joined {
        Ok(outcome) => report.absorb(outcome),
        Err(e) if e.is_cancelled() => {}
        Err(e) => {
            error!(error = %e, "item worker panicked");
            report.failed += 1;
        }
    }
}

fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

const fn every(cycles: u64, period: u32) -> bool {
    period != 0 && cycles % period as u64 == 0
}
