//! The API bridge: where plugin-originated calls meet host capabilities.
//!
//! Methods are addressed as `<namespace>.<operation>`. The namespace picks
//! a registered [`CapabilityProvider`]; the provider's explicit allow-list
//! maps the operation to the capability it requires. Nothing outside an
//! allow-list is reachable.

pub mod storage;

use crate::error::{HostResult, PluginHostError};
use crate::manifest::PluginManifest;
use crate::permissions::PermissionManager;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

pub use storage::MemoryStorage;

/// A host capability exposed to plugins.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Method namespace, e.g. `storage`.
    fn namespace(&self) -> &str;

    /// Capability required for `operation`, or `None` if the operation is
    /// not exposed.
    fn required_capability(&self, operation: &str) -> Option<&str>;

    async fn invoke(&self, plugin_id: &str, operation: &str, args: Vec<Value>) -> HostResult<Value>;
}

type ProviderMap = HashMap<String, Arc<dyn CapabilityProvider>>;

/// Registry of capability providers, shared by every plugin API handle.
#[derive(Clone)]
pub struct ApiBridge {
    permissions: Arc<PermissionManager>,
    providers: Arc<RwLock<ProviderMap>>,
}

impl ApiBridge {
    pub fn new(permissions: Arc<PermissionManager>) -> Self {
        Self {
            permissions,
            providers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registers `provider` under its namespace, replacing any previous one.
    pub fn register_provider(&self, provider: Arc<dyn CapabilityProvider>) {
        let namespace = provider.namespace().to_string();
        let mut providers = self
            .providers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if providers.insert(namespace.clone(), provider).is_some() {
            warn!(namespace = %namespace, "replaced capability provider");
        }
    }

    pub fn namespaces(&self) -> Vec<String> {
        let providers = self
            .providers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut names: Vec<String> = providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Builds the API handle a plugin's sandbox dispatches calls to.
    pub fn create_api(&self, manifest: &PluginManifest) -> PluginApi {
        PluginApi {
            plugin_id: Arc::from(manifest.id.as_str()),
            bridge: self.clone(),
        }
    }

    fn provider(&self, namespace: &str) -> Option<Arc<dyn CapabilityProvider>> {
        self.providers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(namespace)
            .cloned()
    }
}

/// Per-plugin proxy over the bridge. Every call is permission-checked.
#[derive(Clone)]
pub struct PluginApi {
    plugin_id: Arc<str>,
    bridge: ApiBridge,
}

impl PluginApi {
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub async fn call(&self, method: &str, args: Vec<Value>) -> HostResult<Value> {
        let unknown = || PluginHostError::UnknownMethod {
            plugin_id: self.plugin_id.to_string(),
            method: method.to_string(),
        };

        let (namespace, operation) = method.split_once('.').ok_or_else(unknown)?;
        let provider = self.bridge.provider(namespace).ok_or_else(unknown)?;
        let capability = provider
            .required_capability(operation)
            .ok_or_else(unknown)?
            .to_string();

        if !self
            .bridge
            .permissions
            .has_permission(&self.plugin_id, &capability)
            .await
        {
            return Err(PluginHostError::PermissionDenied {
                plugin_id: self.plugin_id.to_string(),
                permission: capability,
            });
        }

        debug!(plugin_id = %self.plugin_id, method = %method, "bridge call");
        provider.invoke(&self.plugin_id, operation, args).await
    }
}
