//! Error boundary around every cross-boundary call.
//!
//! Failures are recorded per plugin. When a plugin's error count within
//! the sliding window exceeds the threshold, the boundary emits a single
//! `plugin:error` event and asks the manager to deactivate the plugin. The
//! boundary re-arms once the count drops back under the threshold.

use crate::config::BoundaryConfig;
use crate::error::HostResult;
use crate::events::{EventBus, HostEvent};
use crate::monitor::PerformanceMonitor;
use crate::notice::{Notice, NoticeSender};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A single recorded failure.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Stable error kind, e.g. `MessageTimeout`.
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    at: Instant,
}

#[derive(Debug, Default)]
struct PluginErrors {
    records: VecDeque<ErrorRecord>,
    tripped: bool,
}

pub struct ErrorBoundary {
    config: BoundaryConfig,
    errors: Mutex<HashMap<String, PluginErrors>>,
    monitor: PerformanceMonitor,
    events: EventBus,
    notices: NoticeSender,
}

impl ErrorBoundary {
    pub fn new(config: BoundaryConfig, events: EventBus, notices: NoticeSender) -> Self {
        Self {
            config,
            errors: Mutex::new(HashMap::new()),
            monitor: PerformanceMonitor::new(),
            events,
            notices,
        }
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    /// Runs `call`, recording its latency and any failure against `plugin_id`.
    pub async fn wrap<T, F>(&self, plugin_id: &str, method: &str, call: F) -> HostResult<T>
    where
        F: Future<Output = HostResult<T>>,
    {
        let started = Instant::now();
        let result = call.await;
        self.monitor
            .record(plugin_id, method, started.elapsed(), result.is_ok())
            .await;

        if let Err(e) = &result {
            self.record_failure(plugin_id, Some(method), e.kind(), &e.to_string())
                .await;
        }
        result
    }

    /// Records a failure. Returns `true` if this failure started a storm.
    pub async fn record_failure(
        &self,
        plugin_id: &str,
        method: Option<&str>,
        kind: &str,
        message: &str,
    ) -> bool {
        let now = Instant::now();
        let window = self.config.window();
        // The log must hold at least one storm's worth of records
        let cap = self.config.max_records.max(self.config.error_threshold + 1);

        let mut errors = self.errors.lock().await;
        let entry = errors.entry(plugin_id.to_string()).or_default();
        entry.records.push_back(ErrorRecord {
            error: kind.to_string(),
            message: message.to_string(),
            method: method.map(str::to_string),
            timestamp: Utc::now(),
            at: now,
        });
        while entry.records.len() > cap {
            entry.records.pop_front();
        }

        let recent = entry
            .records
            .iter()
            .filter(|r| now.duration_since(r.at) < window)
            .count();
        debug!(plugin_id = %plugin_id, kind = %kind, recent, "plugin error recorded");

        if recent <= self.config.error_threshold {
            entry.tripped = false;
            return false;
        }
        if entry.tripped {
            return false;
        }
        entry.tripped = true;
        drop(errors);

        warn!(
            plugin_id = %plugin_id,
            errors = recent,
            window_secs = self.config.window_secs,
            "failure storm detected, disabling plugin"
        );
        self.events.emit(HostEvent::error(plugin_id, recent, message));
        let _ = self.notices.send(Notice::FailureStorm {
            plugin_id: plugin_id.to_string(),
            errors: recent,
        });
        true
    }

    /// Errors recorded for `plugin_id` within the current window.
    pub async fn recent_errors(&self, plugin_id: &str) -> usize {
        let now = Instant::now();
        let window = self.config.window();
        self.errors.lock().await.get(plugin_id).map_or(0, |e| {
            e.records
                .iter()
                .filter(|r| now.duration_since(r.at) < window)
                .count()
        })
    }

    /// The retained error log, oldest first.
    pub async fn records(&self, plugin_id: &str) -> Vec<ErrorRecord> {
        self.errors
            .lock()
            .await
            .get(plugin_id)
            .map(|e| e.records.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forgets every record and statistic for `plugin_id`.
    pub async fn clear(&self, plugin_id: &str) {
        self.errors.lock().await.remove(plugin_id);
        self.monitor.clear(plugin_id).await;
    }
}
