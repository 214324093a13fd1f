//! Daemon settings.
//!
//! Read from `settings.json` in the user's config directory, then overridden
//! from the environment. The remote API key is only ever taken from the
//! environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use mailsort_core::{Category, EngineConfig, ProcessorConfig, Taxonomy, taxonomy};
use serde::{Deserialize, Serialize};

/// Settings file override.
pub const CONFIG_ENV: &str = "MAILSORT_CONFIG";
/// Remote classifier API key.
pub const API_KEY_ENV: &str = "MAILSORT_API_KEY";
/// Data directory override.
pub const DATA_DIR_ENV: &str = "MAILSORT_DATA_DIR";
/// Dry-run switch.
pub const DRY_RUN_ENV: &str = "MAILSORT_DRY_RUN";

/// Remote classifier endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    /// Chat-completions URL.
    pub endpoint: String,
    /// Model name sent with each request.
    pub model: String,
    /// Bearer token; never read from or written to the file.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.perplexity.ai/chat/completions".to_string(),
            model: "sonar-pro".to_string(),
            api_key: None,
        }
    }
}

/// Everything the daemon reads at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where the rule database and state image live.
    pub data_dir: Option<PathBuf>,
    /// Root of the Maildir++ tree.
    pub maildir_root: PathBuf,
    /// Folders scanned for new mail.
    pub sources: Vec<String>,
    /// Pause between cycles, in seconds.
    pub poll_interval_secs: u64,
    /// Log intended moves only.
    pub dry_run: bool,
    /// Items handled concurrently.
    pub workers: usize,
    /// Items taken from one source per cycle.
    pub max_items_per_source: usize,
    /// Save the state every this many cycles.
    pub snapshot_every: u32,
    /// Grace period for in-flight items on shutdown, in seconds.
    pub shutdown_grace_secs: u64,
    /// Remote classifier.
    pub remote: RemoteSettings,
    /// Engine tunables.
    pub engine: EngineConfig,
    /// Category set; the built-in set when absent.
    pub categories: Option<Vec<Category>>,
}

impl Default for Settings {
    fn default() -> Self {
        let processor = ProcessorConfig::default();
        Self {
            data_dir: None,
            maildir_root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("Maildir"),
            sources: processor.sources,
            poll_interval_secs: processor.poll_interval_secs,
            dry_run: processor.dry_run,
            workers: processor.workers,
            max_items_per_source: processor.max_items_per_source,
            snapshot_every: processor.snapshot_every,
            shutdown_grace_secs: processor.shutdown_grace_secs,
            remote: RemoteSettings::default(),
            engine: EngineConfig::default(),
            categories: None,
        }
    }
}

impl Settings {
    /// Default settings file location.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mailsort")
            .join("settings.json")
    }

    /// Load settings from the file named by `MAILSORT_CONFIG` or the default
    /// location, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var_os(CONFIG_ENV).map_or_else(Self::default_path, PathBuf::from);
        let mut settings = Self::from_file(&path)?;
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Read settings from `path`; a missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parsing settings in {}", path.display()))
    }

    /// Apply environment overrides read through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(key) = var(API_KEY_ENV).filter(|k| !k.trim().is_empty()) {
            self.remote.api_key = Some(key.trim().to_string());
        }
        if let Some(dir) = var(DATA_DIR_ENV).filter(|d| !d.is_empty()) {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(flag) = var(DRY_RUN_ENV) {
            self.dry_run = matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
    }

    /// Data directory, defaulting to `<data dir>/mailsort`.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("mailsort")
        })
    }

    /// Path of the rule database.
    #[must_use]
    pub fn rules_db(&self) -> PathBuf {
        self.data_dir().join("rules.db")
    }

    /// Path of the state image.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.data_dir().join("state.json")
    }

    /// The configured category set.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured categories are invalid.
    pub fn taxonomy(&self) -> anyhow::Result<Taxonomy> {
        let categories = self
            .categories
            .clone()
            .unwrap_or_else(taxonomy::default_categories);
        Taxonomy::new(categories).context("invalid category configuration")
    }

    /// Polling loop settings.
    #[must_use]
    pub fn processor(&self) -> ProcessorConfig {
        ProcessorConfig {
            sources: self.sources.clone(),
            workers: self.workers,
            max_items_per_source: self.max_items_per_source,
            dry_run: self.dry_run,
            poll_interval_secs: self.poll_interval_secs,
            snapshot_every: self.snapshot_every,
            shutdown_grace_secs: self.shutdown_grace_secs,
            state_path: Some(self.state_path()),
            ..ProcessorConfig::default()
        }
    }
}
