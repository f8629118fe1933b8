//! Error types for the plugin host.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginHostError {
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("plugin already registered: {0}")]
    DuplicateId(String),

    #[error("plugin '{plugin_id}' depends on '{dependency}' ({requirement}) which cannot be resolved")]
    UnresolvedDependency {
        plugin_id: String,
        dependency: String,
        requirement: String,
    },

    #[error("cyclic dependency: {}", chain.join(" -> "))]
    CyclicDependency { chain: Vec<String> },

    #[error("plugin '{plugin_id}' requests unknown capability '{capability}'")]
    UnknownCapability {
        plugin_id: String,
        capability: String,
    },

    #[error("permission denied: plugin '{plugin_id}' lacks '{permission}' capability")]
    PermissionDenied {
        plugin_id: String,
        permission: String,
    },

    #[error("failed to create sandbox for '{plugin_id}': {reason}")]
    SandboxCreation { plugin_id: String, reason: String },

    #[error("plugin '{plugin_id}' did not signal ready within {timeout_ms}ms")]
    LoadTimeout { plugin_id: String, timeout_ms: u64 },

    #[error("no response from '{plugin_id}' to '{method}' within {timeout_ms}ms")]
    MessageTimeout {
        plugin_id: String,
        method: String,
        timeout_ms: u64,
    },

    #[error("sandbox for '{plugin_id}' was destroyed")]
    SandboxDestroyed { plugin_id: String },

    #[error("timeout: plugin '{plugin_id}' exceeded {budget_ms}ms budget for '{method}'")]
    ExecutionTimeout {
        plugin_id: String,
        method: String,
        budget_ms: u64,
    },

    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("cannot {operation} plugin '{plugin_id}' while {status}")]
    InvalidState {
        plugin_id: String,
        status: String,
        operation: &'static str,
    },

    #[error("unknown method '{method}' requested by plugin '{plugin_id}'")]
    UnknownMethod { plugin_id: String, method: String },

    #[error("plugin '{plugin_id}' failed '{method}': {message}")]
    PluginCallFailed {
        plugin_id: String,
        method: String,
        message: String,
    },

    #[error("capability '{capability}' not supported by plugin '{plugin_id}'")]
    CapabilityNotSupported {
        plugin_id: String,
        capability: String,
    },

    #[error("channel error for '{plugin_id}': {message}")]
    Channel { plugin_id: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PluginHostError {
    /// Stable name of the error variant, used in error records.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidManifest(_) => "InvalidManifest",
            Self::DuplicateId(_) => "DuplicateId",
            Self::UnresolvedDependency { .. } => "UnresolvedDependency",
            Self::CyclicDependency { .. } => "CyclicDependency",
            Self::UnknownCapability { .. } => "UnknownCapability",
            Self::PermissionDenied { .. } => "PermissionDenied",
            Self::SandboxCreation { .. } => "SandboxCreationError",
            Self::LoadTimeout { .. } => "LoadTimeout",
            Self::MessageTimeout { .. } => "MessageTimeout",
            Self::SandboxDestroyed { .. } => "SandboxDestroyed",
            Self::ExecutionTimeout { .. } => "ExecutionTimeout",
            Self::PluginNotFound(_) => "PluginNotFound",
            Self::InvalidState { .. } => "InvalidState",
            Self::UnknownMethod { .. } => "UnknownMethod",
            Self::PluginCallFailed { .. } => "PluginCallFailed",
            Self::CapabilityNotSupported { .. } => "CapabilityNotSupported",
            Self::Channel { .. } => "ChannelError",
            Self::Serialization(_) => "Serialization",
            Self::Config(_) => "Config",
        }
    }
}

pub type HostResult<T> = Result<T, PluginHostError>;
