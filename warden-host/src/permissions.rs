//! Capability-based permission model for plugin sandboxes.
//!
//! Capabilities are hierarchical dotted strings. A grant of a top-level
//! capability (`storage`) implies every child (`storage.local`).
//!
//! Two tiers:
//! - Auto-granted: declared in the manifest and granted on load
//! - Consent-required: granted only after the user approves
//!   (location, media devices, clipboard read, file write, system notifications)
//!
//! Host policy may add consent-required capabilities or deny some outright.

use crate::config::PermissionPolicy;
use crate::consent::{ConsentProvider, ConsentRequest};
use crate::error::{HostResult, PluginHostError};
use crate::manifest::PluginManifest;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Every capability a manifest may declare.
pub const KNOWN_CAPABILITIES: &[&str] = &[
    "storage",
    "storage.local",
    "storage.session",
    "ui",
    "ui.toolbar",
    "ui.panel",
    "events",
    "network",
    "network.fetch",
    "clipboard",
    "clipboard.read",
    "clipboard.write",
    "files",
    "files.read",
    "files.write",
    "location",
    "media",
    "media.camera",
    "media.microphone",
    "notifications",
    "notifications.system",
];

const SENSITIVE_CAPABILITIES: &[&str] = &[
    "location",
    "media",
    "media.camera",
    "media.microphone",
    "clipboard.read",
    "files.write",
    "notifications.system",
];

/// Permission tier classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionTier {
    AutoGranted,
    ConsentRequired,
}

/// The segment before the first `.`, or the whole capability.
pub fn top_level(capability: &str) -> &str {
    capability
        .split_once('.')
        .map_or(capability, |(parent, _)| parent)
}

/// Known capabilities plus the host policy layered over them.
#[derive(Debug, Clone)]
pub struct CapabilityCatalog {
    known: BTreeSet<String>,
    sensitive: HashSet<String>,
    denied: HashSet<String>,
}

impl CapabilityCatalog {
    /// The built-in catalog with no host policy applied.
    pub fn builtin() -> Self {
        Self {
            known: KNOWN_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            sensitive: SENSITIVE_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            denied: HashSet::new(),
        }
    }

    /// The built-in catalog extended by host policy. Policy entries naming
    /// unknown capabilities are ignored with a warning.
    pub fn with_policy(policy: &PermissionPolicy) -> Self {
        let mut catalog = Self::builtin();
        for capability in &policy.consent_required {
            if catalog.is_known(capability) {
                catalog.sensitive.insert(capability.clone());
            } else {
                warn!(capability = %capability, "ignoring unknown consent_required capability");
            }
        }
        for capability in &policy.denied {
            if catalog.is_known(capability) {
                catalog.denied.insert(capability.clone());
            } else {
                warn!(capability = %capability, "ignoring unknown denied capability");
            }
        }
        catalog
    }

    pub fn is_known(&self, capability: &str) -> bool {
        self.known.contains(capability)
    }

    /// A capability needs consent when it is sensitive, sits under a
    /// sensitive parent, or is the parent of a sensitive child.
    pub fn tier(&self, capability: &str) -> PermissionTier {
        let parent = top_level(capability);
        let sensitive = self.sensitive.contains(capability)
            || self.sensitive.contains(parent)
            || self.sensitive.iter().any(|s| s != capability && top_level(s) == capability);
        if sensitive {
            PermissionTier::ConsentRequired
        } else {
            PermissionTier::AutoGranted
        }
    }

    /// Whether host policy refuses `capability`, directly or through the
    /// parent/child relation.
    pub fn is_denied(&self, capability: &str) -> bool {
        self.denied.iter().any(|d| {
            d == capability || d == top_level(capability) || top_level(d) == capability
        })
    }
}

impl Default for CapabilityCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Tracks the capabilities granted to each plugin.
pub struct PermissionManager {
    catalog: CapabilityCatalog,
    consent: Arc<dyn ConsentProvider>,
    grants: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl PermissionManager {
    pub fn new(catalog: CapabilityCatalog, consent: Arc<dyn ConsentProvider>) -> Self {
        Self {
            catalog,
            consent,
            grants: RwLock::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &CapabilityCatalog {
        &self.catalog
    }

    /// Validates and grants every capability `manifest` declares.
    ///
    /// All-or-nothing: an unknown capability, a policy denial or a refused
    /// consent prompt fails the whole check and records nothing.
    pub async fn check_permissions(&self, manifest: &PluginManifest) -> HostResult<Vec<String>> {
        let plugin_id = &manifest.id;
        let requested: BTreeSet<String> = manifest.permissions.iter().cloned().collect();

        for capability in &requested {
            if !self.catalog.is_known(capability) {
                return Err(PluginHostError::UnknownCapability {
                    plugin_id: plugin_id.clone(),
                    capability: capability.clone(),
                });
            }
            if self.catalog.is_denied(capability) {
                warn!(plugin_id = %plugin_id, capability = %capability, "capability denied by host policy");
                return Err(PluginHostError::PermissionDenied {
                    plugin_id: plugin_id.clone(),
                    permission: capability.clone(),
                });
            }
        }

        let needs_consent: Vec<String> = requested
            .iter()
            .filter(|c| self.catalog.tier(c) == PermissionTier::ConsentRequired)
            .cloned()
            .collect();

        if !needs_consent.is_empty() {
            let request = ConsentRequest {
                plugin_id: plugin_id.clone(),
                plugin_name: manifest.name.clone(),
                capabilities: needs_consent.clone(),
                requested_at: Utc::now(),
            };
            if !self.consent.request_consent(request).await {
                info!(plugin_id = %plugin_id, capabilities = ?needs_consent, "user refused consent");
                return Err(PluginHostError::PermissionDenied {
                    plugin_id: plugin_id.clone(),
                    permission: needs_consent.join(", "),
                });
            }
        }

        let granted: Vec<String> = requested.iter().cloned().collect();
        self.grants
            .write()
            .await
            .insert(plugin_id.clone(), requested);
        info!(plugin_id = %plugin_id, granted = ?granted, "permissions granted");
        Ok(granted)
    }

    /// Exact match, else whether the top-level parent was granted.
    pub async fn has_permission(&self, plugin_id: &str, capability: &str) -> bool {
        let grants = self.grants.read().await;
        grants.get(plugin_id).is_some_and(|set| {
            set.contains(capability) || set.contains(top_level(capability))
        })
    }

    /// Removes one capability, or every grant when `capability` is `None`.
    /// Returns whether anything was removed.
    pub async fn revoke(&self, plugin_id: &str, capability: Option<&str>) -> bool {
        let mut grants = self.grants.write().await;
        let removed = match capability {
            None => grants.remove(plugin_id).is_some_and(|set| !set.is_empty()),
            Some(capability) => grants
                .get_mut(plugin_id)
                .is_some_and(|set| set.remove(capability)),
        };
        if removed {
            info!(plugin_id = %plugin_id, capability = ?capability, "permission revoked");
        }
        removed
    }

    /// Granted capabilities in sorted order.
    pub async fn granted(&self, plugin_id: &str) -> Vec<String> {
        self.grants
            .read()
            .await
            .get(plugin_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}
