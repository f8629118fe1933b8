//! Sandboxed plugin host for Warden.
//!
//! Runs untrusted plugins in isolated execution contexts, talks to them only
//! through the length-prefixed message protocol in `warden-protocol`, and
//! gates every host capability behind a declared and granted permission.
//!
//! Plugins without a UI run in a background sandbox; plugins that declare a
//! `ui` entry get a UI sandbox attached to a [`SurfaceHost`] under a strict
//! [`ContentPolicy`]. Repeated failures trip the [`ErrorBoundary`], which
//! deactivates the plugin without affecting the host or other plugins.

pub mod boundary;
pub mod bridge;
pub mod config;
pub mod consent;
pub mod descriptor;
mod error;
pub mod events;
mod manager;
pub mod manifest;
pub mod monitor;
pub mod notice;
pub mod permissions;
pub mod resolver;
pub mod sandbox;

pub use boundary::{ErrorBoundary, ErrorRecord};
pub use bridge::{ApiBridge, CapabilityProvider, MemoryStorage, PluginApi};
pub use config::{BoundaryConfig, HostConfig, PermissionPolicy, SandboxConfig, TimeoutConfig};
pub use consent::{ConsentFn, ConsentGate, ConsentProvider, ConsentRequest, StaticConsent};
pub use descriptor::{PluginDescriptor, PluginStatus};
pub use error::{HostResult, PluginHostError};
pub use events::{EventBus, HostEvent};
pub use manager::PluginManager;
pub use manifest::PluginManifest;
pub use monitor::CallStats;
pub use notice::Notice;
pub use permissions::{CapabilityCatalog, PermissionManager, PermissionTier};
pub use sandbox::{
    ContentPolicy, InProcessBackend, IsolationBackend, ProcessBackend, Sandbox, SandboxKind,
    SurfaceHost,
};
