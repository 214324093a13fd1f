//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::checkpoint::CheckpointConfig;
use crate::dispatch::DispatchConfig;
use crate::heuristic::HeuristicConfig;
use crate::learner::LearnerConfig;
use crate::rules::RulesConfig;
use crate::state::CorruptStatePolicy;

/// All engine tunables. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fingerprint cache.
    pub cache: CacheConfig,
    /// Rule book.
    pub rules: RulesConfig,
    /// Correction learning.
    pub learner: LearnerConfig,
    /// Remote dispatch and rate limiting.
    pub dispatch: DispatchConfig,
    /// Heuristic fallback.
    pub heuristic: HeuristicConfig,
    /// Processing checkpoint.
    pub checkpoint: CheckpointConfig,
    /// Handling of an unreadable saved image.
    pub corrupt_state: CorruptStatePolicy,
    /// Few-shot examples sent with each remote request (0 disables them).
    pub few_shot_examples: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            rules: RulesConfig::default(),
            learner: LearnerConfig::default(),
            dispatch: DispatchConfig::default(),
            heuristic: HeuristicConfig::default(),
            checkpoint: CheckpointConfig::default(),
            corrupt_state: CorruptStatePolicy::default(),
            few_shot_examples: 6,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{ "dispatch": { "batch_size": 20 }, "corrupt_state": "abort" }"#,
        )
        .unwrap();

        assert_eq!(config.dispatch.batch_size, 20);
        assert_eq!(config.dispatch.max_calls, 50);
        assert_eq!(config.corrupt_state, CorruptStatePolicy::Abort);
        assert!((config.learner.seed - 0.75).abs() < f64::EPSILON);
        assert_eq!(config.cache.idle_horizon_days, 75);
    }

    #[test]
    fn test_empty_config_is_default() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
    }
}
