//! Per-plugin call latency and failure statistics.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

/// Calls slower than this are logged.
pub const SLOW_CALL_THRESHOLD: Duration = Duration::from_secs(1);

/// Aggregated statistics for one plugin's cross-boundary calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallStats {
    pub calls: u64,
    pub failures: u64,
    pub total_us: u64,
    pub max_us: u64,
    pub last_us: u64,
}

impl CallStats {
    pub fn average(&self) -> Duration {
        if self.calls == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_us / self.calls)
    }

    pub fn max(&self) -> Duration {
        Duration::from_micros(self.max_us)
    }

    pub fn last(&self) -> Duration {
        Duration::from_micros(self.last_us)
    }

    fn record(&mut self, elapsed: Duration, ok: bool) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.calls += 1;
        if !ok {
            self.failures += 1;
        }
        self.total_us = self.total_us.saturating_add(us);
        self.max_us = self.max_us.max(us);
        self.last_us = us;
    }
}

#[derive(Debug, Default)]
pub struct PerformanceMonitor {
    stats: Mutex<HashMap<String, CallStats>>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, plugin_id: &str, method: &str, elapsed: Duration, ok: bool) {
        if elapsed > SLOW_CALL_THRESHOLD {
            warn!(
                plugin_id = %plugin_id,
                method = %method,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow plugin call"
            );
        }
        self.stats
            .lock()
            .await
            .entry(plugin_id.to_string())
            .or_default()
            .record(elapsed, ok);
    }

    pub async fn snapshot(&self, plugin_id: &str) -> Option<CallStats> {
        self.stats.lock().await.get(plugin_id).cloned()
    }

    pub async fn clear(&self, plugin_id: &str) {
        self.stats.lock().await.remove(plugin_id);
    }
}
