use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Core timing and capacity settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Fixed interval between tick starts.
    pub tick_interval_ms: u64,
    /// How long `stop()` waits for an in-flight tick before aborting it.
    pub stop_grace_ms: u64,
    /// Upper bound for a single outbound client send.
    pub send_timeout_ms: u64,
    /// Maximum number of client sends in flight at once.
    pub max_inflight_deliveries: usize,
    /// Number of recent ticks kept in the statistics ring.
    pub stats_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            stop_grace_ms: 2_000,
            send_timeout_ms: 2_000,
            max_inflight_deliveries: 1_024,
            stats_capacity: 256,
        }
    }
}

impl CoreConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms.max(1))
    }
}
