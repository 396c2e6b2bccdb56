/// Tunables for the collaboration service
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::SessionSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Droppable (presence/cursor) messages buffered per connection
    pub outbound_capacity: usize,

    /// Commands buffered per session queue before cursor updates are shed
    pub session_queue_capacity: usize,

    /// Revisions kept per field for evaluating stale causal tokens
    pub field_history_depth: usize,

    /// Replay log entries kept per session before compaction
    pub max_log_entries: usize,

    /// Quiet period after the last accepted edit before an auto-save snapshot
    pub autosave_debounce_ms: u64,

    /// Presence entries untouched for this long are marked offline
    pub idle_timeout_secs: u64,

    /// How often idle presence is swept; 0 disables the sweep
    pub presence_sweep_interval_secs: u64,

    /// Client reconnection policy
    pub reconnect: ReconnectPolicy,

    /// Settings applied to newly started sessions
    pub default_settings: SessionSettings,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            session_queue_capacity: 1024,
            field_history_depth: 32,
            max_log_entries: 10_000,
            autosave_debounce_ms: 2_000,
            idle_timeout_secs: 300,
            presence_sweep_interval_secs: 30,
            reconnect: ReconnectPolicy::default(),
            default_settings: SessionSettings::default(),
        }
    }
}

impl CollabConfig {
    pub fn autosave_debounce(&self) -> Duration {
        Duration::from_millis(self.autosave_debounce_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn presence_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.presence_sweep_interval_secs)
    }
}

/// Bounded exponential backoff: `base * 2^attempt`, capped at `max_delay_ms`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let millis = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = ReconnectPolicy {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            max_attempts: 10,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay(63), Duration::from_millis(1_000));
        assert_eq!(policy.delay(200), Duration::from_millis(1_000));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let raw = r#"{"autosave_debounce_ms": 10, "reconnect": {"max_attempts": 3}}"#;
        let config: CollabConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.autosave_debounce(), Duration::from_millis(10));
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.base_delay_ms, 500);
        assert_eq!(config.outbound_capacity, 256);
    }
}
