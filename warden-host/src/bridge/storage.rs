//! In-memory key/value storage, one keyspace per plugin.

use super::CapabilityProvider;
use crate::error::{HostResult, PluginHostError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

const CAPABILITY: &str = "storage.local";

/// `storage.get(key)`, `storage.set(key, value)`, `storage.remove(key)`,
/// `storage.keys()` and `storage.clear()`.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a value as the host sees it.
    pub async fn get(&self, plugin_id: &str, key: &str) -> Option<Value> {
        self.data.read().await.get(plugin_id)?.get(key).cloned()
    }
}

fn key_arg(plugin_id: &str, operation: &str, args: &[Value]) -> HostResult<String> {
    match args.first() {
        Some(Value::String(key)) => Ok(key.clone()),
        _ => Err(PluginHostError::PluginCallFailed {
            plugin_id: plugin_id.to_string(),
            method: format!("storage.{operation}"),
            message: "expected a string key as the first argument".into(),
        }),
    }
}

#[async_trait]
impl CapabilityProvider for MemoryStorage {
    fn namespace(&self) -> &str {
        "storage"
    }

    fn required_capability(&self, operation: &str) -> Option<&str> {
        match operation {
            "get" | "set" | "remove" | "keys" | "clear" => Some(CAPABILITY),
            _ => None,
        }
    }

    async fn invoke(&self, plugin_id: &str, operation: &str, args: Vec<Value>) -> HostResult<Value> {
        match operation {
            "get" => {
                let key = key_arg(plugin_id, operation, &args)?;
                Ok(self.get(plugin_id, &key).await.unwrap_or(Value::Null))
            }
            "set" => {
                let key = key_arg(plugin_id, operation, &args)?;
                let value = args.get(1).cloned().unwrap_or(Value::Null);
                self.data
                    .write()
                    .await
                    .entry(plugin_id.to_string())
                    .or_default()
                    .insert(key, value);
                Ok(Value::Null)
            }
            "remove" => {
                let key = key_arg(plugin_id, operation, &args)?;
                let removed = self
                    .data
                    .write()
                    .await
                    .get_mut(plugin_id)
                    .and_then(|space| space.remove(&key));
                Ok(removed.unwrap_or(Value::Null))
            }
            "keys" => {
                let data = self.data.read().await;
                let keys = data
                    .get(plugin_id)
                    .map(|space| space.keys().cloned().map(Value::String).collect())
                    .unwrap_or_default();
                Ok(Value::Array(keys))
            }
            "clear" => {
                self.data.write().await.remove(plugin_id);
                Ok(Value::Null)
            }
            other => Err(PluginHostError::UnknownMethod {
                plugin_id: plugin_id.to_string(),
                method: format!("storage.{other}"),
            }),
        }
    }
}
