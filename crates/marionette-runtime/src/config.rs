//! Session configuration
//!
//! Every component keeps its own config struct next to its code; this one
//! only aggregates them so a host can load everything from one document.

use std::path::Path;

use marionette_core::{AvatarError, AvatarResult};
use marionette_state::CacheConfig;
use marionette_time::ClockConfig;
use marionette_transport::RetryConfig;
use marionette_visual::{DecoderConfig, FaceConfig};
use marionette_voice::AudioConfig;
use serde::{Deserialize, Serialize};

use crate::logging::LogConfig;
use crate::scheduler::SchedulerConfig;

/// Complete avatar session configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarConfig {
    pub clock: ClockConfig,
    pub cache: CacheConfig,
    pub decoder: DecoderConfig,
    pub face: FaceConfig,
    pub audio: AudioConfig,
    pub retry: RetryConfig,
    pub scheduler: SchedulerConfig,
    pub log: LogConfig,
}

impl AvatarConfig {
    /// Preset for low-end hosts: smaller caches, fewer decode workers, PCM
    /// audio only
    pub fn constrained() -> Self {
        AvatarConfig {
            cache: CacheConfig::constrained(),
            decoder: DecoderConfig::constrained(),
            audio: AudioConfig {
                container_supported: false,
                ..AudioConfig::default()
            },
            scheduler: SchedulerConfig {
                warmup_frames: 12,
                ..SchedulerConfig::default()
            },
            ..AvatarConfig::default()
        }
    }

    /// Parse from JSON; absent fields take their defaults
    pub fn from_json(text: &str) -> AvatarResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| AvatarError::ResourceInitFailure(format!("invalid config: {e}")))
    }

    pub fn from_file(path: impl AsRef<Path>) -> AvatarResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            AvatarError::ResourceInitFailure(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> AvatarResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| AvatarError::ResourceInitFailure(format!("invalid config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = AvatarConfig::from_json(
            r#"{ "retry": { "max_rounds": 5 }, "decoder": { "workers": 8 } }"#,
        )
        .unwrap();
        assert_eq!(config.retry.max_rounds, 5);
        assert_eq!(config.retry.max_attempts_per_round, 5);
        assert_eq!(config.decoder.workers, 8);
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn test_json_roundtrip() {
        let config = AvatarConfig::constrained();
        let text = config.to_json().unwrap();
        assert_eq!(AvatarConfig::from_json(&text).unwrap(), config);
    }

    #[test]
    fn test_bad_json_is_init_failure() {
        assert!(matches!(
            AvatarConfig::from_json("{ nope"),
            Err(AvatarError::ResourceInitFailure(_))
        ));
    }

    #[test]
    fn test_constrained_preset() {
        let config = AvatarConfig::constrained();
        assert!(!config.audio.container_supported);
        assert!(config.decoder.workers < DecoderConfig::default().workers);
    }
}
