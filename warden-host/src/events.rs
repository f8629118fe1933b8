//! Events broadcast from the plugin host to host-side listeners.

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::trace;

/// Emitted once per failure storm, when a plugin is forcibly deactivated.
pub const PLUGIN_ERROR: &str = "plugin:error";
/// Emitted on every lifecycle status change.
pub const PLUGIN_STATUS: &str = "plugin:status";

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostEvent {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<String>,
    pub data: Value,
}

impl HostEvent {
    /// A plugin-emitted event, re-broadcast as `plugin:<id>:<event>`.
    pub fn plugin(plugin_id: &str, event: &str, data: Value) -> Self {
        Self {
            name: format!("plugin:{plugin_id}:{event}"),
            plugin_id: Some(plugin_id.to_string()),
            data,
        }
    }

    pub fn error(plugin_id: &str, errors: usize, last_error: &str) -> Self {
        Self {
            name: PLUGIN_ERROR.to_string(),
            plugin_id: Some(plugin_id.to_string()),
            data: json!({
                "pluginId": plugin_id,
                "errors": errors,
                "lastError": last_error,
            }),
        }
    }

    pub fn status(plugin_id: &str, status: &str) -> Self {
        Self {
            name: PLUGIN_STATUS.to_string(),
            plugin_id: Some(plugin_id.to_string()),
            data: json!({ "pluginId": plugin_id, "status": status }),
        }
    }
}

/// Fan-out of [`HostEvent`]s. Cloning shares the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HostEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Listeners that fall more than `capacity` events behind miss the oldest.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.tx.subscribe()
    }

    /// Broadcasts `event`, returning how many listeners received it.
    pub fn emit(&self, event: HostEvent) -> usize {
        trace!(event = %event.name, "host event");
        self.tx.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_event_name() {
        let event = HostEvent::plugin("acme.clock", "tick", json!(1));
        assert_eq!(event.name, "plugin:acme.clock:tick");
        assert_eq!(event.plugin_id.as_deref(), Some("acme.clock"));
    }

    #[tokio::test]
    async fn emit_without_listeners_is_fine() {
        let bus = EventBus::new();
        assert_eq!(bus.emit(HostEvent::status("a", "active")), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        assert_eq!(bus.emit(HostEvent::error("a", 11, "boom")), 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, PLUGIN_ERROR);
        assert_eq!(event.data["errors"], 11);
    }
}
