//! Runtime configuration for the broadcast core.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration. Every field has a default so partial JSON
/// documents are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivecastConfig {
    pub reconnect: ReconnectSettings,
    pub renewal: RenewalSettings,
    pub presence: PresenceSettings,
    pub pipeline: PipelineSettings,
    pub store: StoreSettings,

    /// Upper bound for a single join attempt in milliseconds.
    pub join_timeout_ms: u64,
}

impl Default for LivecastConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectSettings::default(),
            renewal: RenewalSettings::default(),
            presence: PresenceSettings::default(),
            pipeline: PipelineSettings::default(),
            store: StoreSettings::default(),
            join_timeout_ms: 15_000,
        }
    }
}

impl LivecastConfig {
    /// Parse a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// Rejoin backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

/// Credential renewal settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenewalSettings {
    /// Consecutive renewal failures before escalating to a rejoin.
    pub max_consecutive_failures: u32,
}

impl Default for RenewalSettings {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 2,
        }
    }
}

/// Viewer presence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceSettings {
    /// Debounce window for host-side viewer count writes.
    pub debounce_ms: u64,

    /// A viewer without a heartbeat for this long is counted as gone.
    pub heartbeat_timeout_ms: u64,

    /// How often expired viewers are swept.
    pub sweep_interval_ms: u64,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            heartbeat_timeout_ms: 45_000,
            sweep_interval_ms: 15_000,
        }
    }
}

impl PresenceSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Recording pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Thumbnail sample point as a fraction of the recording duration.
    pub thumbnail_fraction: f64,

    /// Latest thumbnail sample point in milliseconds.
    pub thumbnail_max_offset_ms: u64,

    /// Bytes per upload progress step.
    pub upload_chunk_bytes: usize,

    /// Object key prefix for replays.
    pub recordings_prefix: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            thumbnail_fraction: 0.1,
            thumbnail_max_offset_ms: 10_000,
            upload_chunk_bytes: 256 * 1024,
            recordings_prefix: "recordings".to_string(),
        }
    }
}

impl PipelineSettings {
    /// Sample point for a thumbnail of a recording of the given length.
    pub fn thumbnail_offset(&self, duration: Duration) -> Duration {
        let at = duration.mul_f64(self.thumbnail_fraction.clamp(0.0, 1.0));
        at.min(Duration::from_millis(self.thumbnail_max_offset_ms))
    }
}

/// Durable store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Optimistic retries for a metadata merge before giving up.
    pub merge_max_retries: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            merge_max_retries: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            LivecastConfig::from_json(r#"{ "reconnect": { "max_attempts": 2 } }"#).unwrap();

        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.reconnect.base_delay_ms, 1_000);
        assert_eq!(config.presence.debounce_ms, 500);
    }

    #[test]
    fn thumbnail_offset_is_capped() {
        let settings = PipelineSettings::default();

        assert_eq!(
            settings.thumbnail_offset(Duration::from_secs(30)),
            Duration::from_secs(3)
        );
        assert_eq!(
            settings.thumbnail_offset(Duration::from_secs(600)),
            Duration::from_secs(10)
        );
    }
}
