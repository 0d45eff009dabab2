//! Connection state and reconnection policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use livecast_ipc::ReconnectSettings;

use crate::{BASE_RECONNECT_DELAY_MS, MAX_RECONNECT_ATTEMPTS, MAX_RECONNECT_DELAY_MS};

/// Connection state for one logical broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected.
    #[default]
    Disconnected,

    /// Joining the channel for the first time.
    Connecting,

    /// Joined, with tracks published or subscribed.
    Connected,

    /// Rejoining after an unexpected disconnect.
    Reconnecting { attempt: u32 },

    /// Reconnection gave up.
    Failed { reason: String },
}

impl ConnectionState {
    /// True once the channel is joined, including between renewals.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// True once rejoining has been given up on.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Reconnecting { .. } => "Reconnecting",
            Self::Failed { .. } => "Failed",
        }
    }
}

/// Rejoin backoff: the delay doubles per attempt up to `max_delay`, and
/// rejoining stops after `max_attempts` failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            base_delay: Duration::from_millis(BASE_RECONNECT_DELAY_MS),
            max_delay: Duration::from_millis(MAX_RECONNECT_DELAY_MS),
        }
    }
}

impl From<&ReconnectSettings> for ReconnectPolicy {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before rejoin attempt `attempt`, counted from 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(multiplier);
        delay.min(self.max_delay)
    }

    /// Whether another rejoin may follow `attempt` failed ones.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
