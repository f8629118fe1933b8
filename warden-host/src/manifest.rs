//! Plugin manifests: the immutable description a plugin ships with.

use crate::error::{HostResult, PluginHostError};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A plugin manifest as declared by its author.
///
/// Required string fields default to empty on deserialization so that a
/// missing field is reported by [`PluginManifest::validate`] as
/// `InvalidManifest` rather than as a parse error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Semantic version, e.g. `1.2.0`.
    #[serde(default)]
    pub version: String,
    /// Entry point launched inside the sandbox.
    #[serde(default)]
    pub main: String,
    /// Entry of the visual surface. Its presence selects a UI-capable sandbox.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Plugin id -> semantic version range.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

impl PluginManifest {
    /// Parses a manifest from JSON text. Structural problems are reported
    /// as `InvalidManifest`; the result is not yet validated.
    pub fn from_json(text: &str) -> HostResult<Self> {
        serde_json::from_str(text).map_err(|e| PluginHostError::InvalidManifest(e.to_string()))
    }

    pub fn validate(&self) -> HostResult<()> {
        if self.id.is_empty() {
            return Err(PluginHostError::InvalidManifest("id is required".into()));
        }
        if self.name.is_empty() {
            return Err(PluginHostError::InvalidManifest("name is required".into()));
        }
        if self.version.is_empty() {
            return Err(PluginHostError::InvalidManifest("version is required".into()));
        }
        if self.main.is_empty() {
            return Err(PluginHostError::InvalidManifest("main is required".into()));
        }
        // Ids appear inside event names (`plugin:<id>:<event>`)
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        {
            return Err(PluginHostError::InvalidManifest(format!(
                "id '{}' may only contain ASCII letters, digits, '.', '-' and '_'",
                self.id
            )));
        }
        self.semver()?;
        self.dependency_requirements()?;
        if self.ui.as_deref().is_some_and(str::is_empty) {
            return Err(PluginHostError::InvalidManifest("ui must not be empty".into()));
        }
        Ok(())
    }

    /// The parsed semantic version.
    pub fn semver(&self) -> HostResult<Version> {
        Version::parse(&self.version).map_err(|e| {
            PluginHostError::InvalidManifest(format!("version '{}': {e}", self.version))
        })
    }

    /// Parsed dependency ranges, ordered by dependency id.
    pub fn dependency_requirements(&self) -> HostResult<Vec<(String, VersionReq)>> {
        self.dependencies
            .iter()
            .map(|(id, range)| {
                if id == &self.id {
                    return Err(PluginHostError::InvalidManifest(format!(
                        "plugin '{id}' cannot depend on itself"
                    )));
                }
                VersionReq::parse(range)
                    .map(|req| (id.clone(), req))
                    .map_err(|e| {
                        PluginHostError::InvalidManifest(format!(
                            "dependency '{id}' range '{range}': {e}"
                        ))
                    })
            })
            .collect()
    }

    pub fn has_ui(&self) -> bool {
        self.ui.is_some()
    }
}
