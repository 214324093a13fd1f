//! Durable engine image.
//!
//! Cache, rules, checkpoint and metrics are saved together as one JSON
//! document. Saving writes a temporary sibling and renames it over the
//! target, so a crash leaves either the old or the new image.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::cache::CacheEntry;
use crate::checkpoint::CheckpointState;
use crate::metrics::MetricsSnapshot;
use crate::rules::LearnedRule;
use crate::{Error, Result};

/// Current image format version.
pub const STATE_VERSION: u32 = 1;

/// What to do when the saved image cannot be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorruptStatePolicy {
    /// Log loudly, move the file aside and start empty.
    #[default]
    Reset,
    /// Fail with [`Error::CorruptState`].
    Abort,
}

/// Everything the engine persists between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateImage {
    /// Format version.
    pub version: u32,
    /// When the image was taken.
    pub saved_at: DateTime<Utc>,
    /// Cache entries.
    pub cache: Vec<CacheEntry>,
    /// Learned rules.
    pub rules: Vec<LearnedRule>,
    /// Processing checkpoint.
    pub checkpoint: CheckpointState,
    /// Counters at save time.
    #[serde(default)]
    pub metrics: MetricsSnapshot,
}

impl StateImage {
    /// Write the image atomically to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or any filesystem step fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_vec_pretty(self)?;
        let tmp = sibling(path, "tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;

        debug!(
            path = %path.display(),
            cache = self.cache.len(),
            rules = self.rules.len(),
            processed = self.checkpoint.processed.len(),
            "saved state"
        );
        Ok(())
    }

    /// Read the image at `path`.
    ///
    /// Returns `None` when there is no image, or when it is unreadable and
    /// `policy` is [`CorruptStatePolicy::Reset`]; the bad file is then
    /// renamed to `<path>.corrupt`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptState`] for an unreadable image under
    /// [`CorruptStatePolicy::Abort`].
    pub fn load(path: &Path, policy: CorruptStatePolicy) -> Result<Option<Self>> {
        if !path.exists() {
            debug!(path = %path.display(), "no saved state");
            return Ok(None);
        }

        let reason = match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<Self>(&bytes) {
                Ok(image) if image.version == STATE_VERSION => return Ok(Some(image)),
                Ok(image) => format!("unsupported version {}", image.version),
                Err(e) => e.to_string(),
            },
            Err(e) => e.to_string(),
        };

        match policy {
            CorruptStatePolicy::Abort => Err(Error::CorruptState {
                path: path.display().to_string(),
                reason,
            }),
            CorruptStatePolicy::Reset => {
                let aside = sibling(path, "corrupt");
                error!(
                    path = %path.display(),
                    %reason,
                    moved_to = %aside.display(),
                    "saved state is unreadable, starting from an empty checkpoint; every item will be reprocessed"
                );
                if let Err(e) = fs::rename(path, &aside) {
                    error!(error = %e, "could not move corrupt state aside");
                }
                Ok(None)
            }
        }
    }
}

/// `<path>.<suffix>`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}
