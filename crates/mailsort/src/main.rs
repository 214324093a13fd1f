//! `MailSort` - adaptive mail sorting daemon
//!
//! Watches Maildir folders, classifies new mail and moves it into category
//! folders, learning from the moves the user makes by hand.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod maildir;
mod remote;
mod settings;

use std::sync::Arc;

use anyhow::Context;
use mailsort_core::{Engine, Processor, RemoteError, SqliteRuleStore};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use maildir::MaildirStore;
use remote::HttpClassifier;
use settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailsort=info,mailsort_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting MailSort");

    let settings = Settings::load().context("loading settings")?;
    let data_dir = settings.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    if !maildir::is_maildir(&settings.maildir_root) {
        anyhow::bail!("{} is not a Maildir", settings.maildir_root.display());
    }

    let rules_db = settings.rules_db();
    let rule_store = SqliteRuleStore::new(&rules_db.to_string_lossy())
        .await
        .with_context(|| format!("opening rule database {}", rules_db.display()))?;

    let mut builder = Engine::builder(settings.taxonomy()?)
        .config(settings.engine.clone())
        .rule_store(Arc::new(rule_store));
    match HttpClassifier::new(&settings.remote, settings.engine.dispatch.call_timeout()) {
        Ok(classifier) => builder = builder.remote(Arc::new(classifier)),
        Err(RemoteError::NotConfigured) => {
            warn!("no API key configured, classifying with local heuristics only");
        }
        Err(e) => return Err(e).context("creating remote classifier"),
    }
    let engine = builder.build().await.context("building engine")?;

    let state_path = settings.state_path();
    if engine
        .load_state(&state_path)
        .await
        .with_context(|| format!("loading state from {}", state_path.display()))?
    {
        info!(path = %state_path.display(), "restored saved state");
    }

    let store = Arc::new(MaildirStore::new(settings.maildir_root.clone()));
    let processor = Processor::new(Arc::new(engine), store, settings.processor());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    if let Err(e) = processor.run(shutdown_rx).await {
        error!(error = %e, "processor stopped with an error");
        return Err(e.into());
    }

    info!("MailSort stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
