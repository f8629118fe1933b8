//! Host configuration, read from `~/.warden/host.toml`.
//!
//! Every section and field is optional; anything left out keeps its default.
//!
//! ```toml
//! [timeouts]
//! load_ms = 5000
//! call_ms = 30000
//! cleanup_ms = 2000
//!
//! [boundary]
//! error_threshold = 10
//! window_secs = 60
//! max_records = 100
//!
//! [permissions]
//! consent_required = ["network"]
//! denied = ["media"]
//!
//! [sandbox]
//! max_instances = 64
//! max_inbound_calls = 32
//! interpreter = "node"
//! inherit_stderr = true
//! ```

use crate::error::{HostResult, PluginHostError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Deadlines applied to cross-boundary operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// How long a sandbox may take to signal `ready` after load.
    pub load_ms: u64,
    /// Default deadline for a single host -> plugin call.
    pub call_ms: u64,
    /// Deadline for the best-effort `cleanup` call during unload.
    pub cleanup_ms: u64,
}

impl TimeoutConfig {
    pub fn load(&self) -> Duration {
        Duration::from_millis(self.load_ms)
    }

    pub fn call(&self) -> Duration {
        Duration::from_millis(self.call_ms)
    }

    pub fn cleanup(&self) -> Duration {
        Duration::from_millis(self.cleanup_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            load_ms: 5_000,
            call_ms: 30_000,
            cleanup_ms: 2_000,
        }
    }
}

/// Failure-storm detection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundaryConfig {
    /// A plugin is disabled once its error count in the window exceeds this.
    pub error_threshold: usize,
    pub window_secs: u64,
    /// Per-plugin cap on retained error records; oldest are evicted first.
    pub max_records: usize,
}

impl BoundaryConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            error_threshold: 10,
            window_secs: 60,
            max_records: 100,
        }
    }
}

/// Host policy layered over the built-in capability catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionPolicy {
    /// Extra capabilities that must go through user consent.
    pub consent_required: Vec<String>,
    /// Capabilities refused outright; the user is never prompted for them.
    pub denied: Vec<String>,
}

/// Settings for the child-process isolation backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Maximum number of live isolates at once.
    pub max_instances: usize,
    /// Plugin -> host calls answered concurrently per sandbox. Further
    /// calls wait until one finishes.
    pub max_inbound_calls: usize,
    /// Program used to run entry points, e.g. `node`. When unset the entry
    /// point itself is executed.
    pub interpreter: Option<String>,
    pub interpreter_args: Vec<String>,
    /// Forward plugin stderr to the host's stderr.
    pub inherit_stderr: bool,
    /// Extra environment passed to every plugin process.
    pub env: BTreeMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_instances: 64,
            max_inbound_calls: 32,
            interpreter: None,
            interpreter_args: Vec::new(),
            inherit_stderr: true,
            env: BTreeMap::new(),
        }
    }
}

/// Complete host configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub timeouts: TimeoutConfig,
    pub boundary: BoundaryConfig,
    pub permissions: PermissionPolicy,
    pub sandbox: SandboxConfig,
}

impl HostConfig {
    /// Loads `~/.warden/host.toml` if it exists.
    /// Falls back to defaults with a warning on read or parse errors.
    pub fn load() -> Self {
        Self::load_from(Self::default_path())
    }

    pub fn default_path() -> PathBuf {
        config_dir().join("host.toml")
    }

    /// Loads configuration from an explicit path, falling back to defaults.
    pub fn load_from(path: PathBuf) -> Self {
        if !path.exists() {
            info!("No host config found at {:?}, using defaults", path);
            return Self::default();
        }

        match Self::read(&path) {
            Ok(config) => {
                info!("Loaded host config from {:?}", path);
                config
            }
            Err(e) => {
                warn!("{}. Falling back to default host config.", e);
                Self::default()
            }
        }
    }

    /// Reads and validates a config file, surfacing every failure.
    pub fn read(path: &Path) -> HostResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| PluginHostError::Config(format!("failed to read {path:?}: {e}")))?;
        Self::from_toml_str(&contents)
            .map_err(|e| PluginHostError::Config(format!("{path:?}: {e}")))
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(contents: &str) -> HostResult<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| PluginHostError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> HostResult<()> {
        if self.timeouts.load_ms == 0 || self.timeouts.call_ms == 0 {
            return Err(PluginHostError::Config(
                "timeouts must be greater than zero".into(),
            ));
        }
        if self.boundary.window_secs == 0 {
            return Err(PluginHostError::Config(
                "boundary.window_secs must be greater than zero".into(),
            ));
        }
        if self.sandbox.max_instances == 0 {
            return Err(PluginHostError::Config(
                "sandbox.max_instances must be greater than zero".into(),
            ));
        }
        if self.sandbox.max_inbound_calls == 0 {
            return Err(PluginHostError::Config(
                "sandbox.max_inbound_calls must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Resolve the Warden config directory.
fn config_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        Path::new(&home).join(".warden")
    } else if let Ok(home) = std::env::var("USERPROFILE") {
        Path::new(&home).join(".warden")
    } else {
        PathBuf::from(".warden")
    }
}
