//! Registered plugins and their lifecycle status.

use crate::error::{HostResult, PluginHostError};
use crate::manifest::PluginManifest;
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Lifecycle status of a registered plugin.
///
/// ```text
/// registered -> loading -> active <-> deactivated -> unloaded
///                  \          \          /
///                   +-------> crashed <-+
/// ```
///
/// `crashed` and `unloaded` plugins may be loaded again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Registered,
    Loading,
    Active,
    Deactivated,
    Crashed,
    Unloaded,
}

impl PluginStatus {
    pub fn can_transition_to(self, next: PluginStatus) -> bool {
        use PluginStatus::*;
        matches!(
            (self, next),
            (Registered, Loading)
                | (Registered, Unloaded)
                | (Loading, Active)
                | (Loading, Crashed)
                | (Active, Deactivated)
                | (Active, Crashed)
                | (Active, Unloaded)
                | (Deactivated, Active)
                | (Deactivated, Crashed)
                | (Deactivated, Unloaded)
                | (Crashed, Loading)
                | (Crashed, Unloaded)
                | (Unloaded, Loading)
        )
    }

    /// Whether a sandbox is expected to exist in this status.
    pub fn is_loaded(self) -> bool {
        matches!(self, Self::Active | Self::Deactivated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Loading => "loading",
            Self::Active => "active",
            Self::Deactivated => "deactivated",
            Self::Crashed => "crashed",
            Self::Unloaded => "unloaded",
        }
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered plugin: its manifest plus mutable runtime status.
#[derive(Debug, Clone, Serialize)]
pub struct PluginDescriptor {
    manifest: PluginManifest,
    version: Version,
    status: PluginStatus,
    last_error: Option<String>,
    config: Value,
    registered_at: DateTime<Utc>,
}

impl PluginDescriptor {
    /// Validates `manifest` and wraps it in a `registered` descriptor.
    pub fn new(manifest: PluginManifest) -> HostResult<Self> {
        manifest.validate()?;
        let version = manifest.semver()?;
        Ok(Self {
            manifest,
            version,
            status: PluginStatus::Registered,
            last_error: None,
            config: Value::Object(Default::default()),
            registered_at: Utc::now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn status(&self) -> PluginStatus {
        self.status
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub(crate) fn set_config(&mut self, config: Value) {
        self.config = config;
    }

    /// Moves to `next`, rejecting transitions outside the lifecycle graph.
    pub(crate) fn transition(&mut self, next: PluginStatus, operation: &'static str) -> HostResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(PluginHostError::InvalidState {
                plugin_id: self.manifest.id.clone(),
                status: self.status.to_string(),
                operation,
            });
        }
        self.status = next;
        if next != PluginStatus::Crashed {
            self.last_error = None;
        }
        Ok(())
    }

    /// Records an unrecoverable error. Statuses that cannot crash keep
    /// their status but still remember the error.
    pub(crate) fn mark_crashed(&mut self, error: &PluginHostError) {
        if self.status.can_transition_to(PluginStatus::Crashed) {
            self.status = PluginStatus::Crashed;
        }
        self.last_error = Some(error.to_string());
    }
}
