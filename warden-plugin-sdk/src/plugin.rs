use crate::HostHandle;
use async_trait::async_trait;
use serde_json::Value;

/// A plugin's side of the lifecycle.
///
/// Every method has a do-nothing default, so a plugin only implements what
/// it needs. Methods take `&self` because calls may run concurrently; keep
/// mutable state behind a lock.
///
/// An `Err` is reported back to the host as the call's error.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// First call after `ready`. `permissions` lists the granted
    /// capabilities.
    async fn initialize(
        &self,
        _host: &HostHandle,
        _config: Value,
        _permissions: Vec<String>,
    ) -> Result<Value, String> {
        Ok(Value::Null)
    }

    async fn activate(&self, _host: &HostHandle) -> Result<Value, String> {
        Ok(Value::Null)
    }

    async fn deactivate(&self, _host: &HostHandle) -> Result<Value, String> {
        Ok(Value::Null)
    }

    async fn update_config(&self, _host: &HostHandle, _config: Value) -> Result<Value, String> {
        Ok(Value::Null)
    }

    /// Last call before the sandbox is torn down.
    async fn cleanup(&self, _host: &HostHandle) -> Result<Value, String> {
        Ok(Value::Null)
    }

    /// Any method outside the lifecycle.
    async fn handle_call(
        &self,
        _host: &HostHandle,
        method: &str,
        _args: Vec<Value>,
    ) -> Result<Value, String> {
        Err(format!("unknown method: {method}"))
    }
}
