//! Plugin sandboxes.
//!
//! A sandbox owns one isolate from an [`IsolationBackend`] and the message
//! channel into it. Two variants share a common core:
//!
//! - [`UiSandbox`] for plugins with a visual surface, allocated under a
//!   restrictive [`ContentPolicy`]
//! - [`BackgroundSandbox`] for headless plugins

mod background;
mod channel;
mod in_process;
mod isolate;
mod process;
mod shared;
mod ui;

pub use background::BackgroundSandbox;
pub use channel::InboundRouter;
pub use in_process::{GuestIo, InProcessBackend};
pub use isolate::{BoxedReader, BoxedWriter, Conduit, Isolate, IsolateRequest, IsolationBackend};
pub use process::ProcessBackend;
pub use ui::{HeadlessSurface, SurfaceHost, UiSandbox};

use self::shared::SandboxCore;
use crate::config::TimeoutConfig;
use crate::error::{HostResult, PluginHostError};
use crate::manifest::PluginManifest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    Ui,
    Background,
}

impl SandboxKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ui => "ui",
            Self::Background => "background",
        }
    }
}

impl fmt::Display for SandboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where scripts inside a UI surface may come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptSource {
    /// Only the bootstrap injected by the host.
    BootstrapOnly,
    /// The plugin's own bundled files as well.
    PluginBundle,
}

/// Restrictions applied to a UI-capable isolate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPolicy {
    pub allow_nested_contexts: bool,
    pub allow_top_navigation: bool,
    pub scripts: ScriptSource,
}

impl ContentPolicy {
    /// No nested contexts, no top-level navigation, bootstrap scripts only.
    pub fn strict() -> Self {
        Self {
            allow_nested_contexts: false,
            allow_top_navigation: false,
            scripts: ScriptSource::BootstrapOnly,
        }
    }
}

impl Default for ContentPolicy {
    fn default() -> Self {
        Self::strict()
    }
}

/// An isolated execution context for one plugin.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn plugin_id(&self) -> &str;

    fn kind(&self) -> SandboxKind;

    /// Host-unique number distinguishing this sandbox from earlier ones
    /// created for the same plugin.
    fn instance(&self) -> u64;

    /// Allocates the isolate.
    async fn create(&mut self) -> HostResult<()>;

    /// Launches the plugin and waits for its `ready` signal.
    async fn load(&mut self, entry_point: &str) -> HostResult<()>;

    /// Calls `method` inside the plugin and waits for its response.
    async fn send_call(&self, method: &str, args: Vec<Value>) -> HostResult<Value>;

    /// Tears the sandbox down, rejecting in-flight calls with
    /// `SandboxDestroyed`.
    fn destroy(&self);

    fn is_destroyed(&self) -> bool;

    /// Calls still waiting for a response.
    fn pending_calls(&self) -> usize;

    fn show(&self) -> HostResult<()> {
        Err(PluginHostError::CapabilityNotSupported {
            plugin_id: self.plugin_id().to_string(),
            capability: "ui-surface".into(),
        })
    }

    fn hide(&self) -> HostResult<()> {
        Err(PluginHostError::CapabilityNotSupported {
            plugin_id: self.plugin_id().to_string(),
            capability: "ui-surface".into(),
        })
    }

    fn is_visible(&self) -> bool {
        false
    }
}

/// Creates sandboxes of the right variant for a manifest.
pub struct SandboxManager {
    backend: Arc<dyn IsolationBackend>,
    surface: Arc<dyn SurfaceHost>,
    timeouts: TimeoutConfig,
    policy: ContentPolicy,
    next_instance: AtomicU64,
}

impl SandboxManager {
    pub fn new(backend: Arc<dyn IsolationBackend>, timeouts: TimeoutConfig) -> Self {
        Self {
            backend,
            surface: Arc::new(HeadlessSurface),
            timeouts,
            policy: ContentPolicy::strict(),
            next_instance: AtomicU64::new(1),
        }
    }

    pub fn set_surface_host(&mut self, surface: Arc<dyn SurfaceHost>) {
        self.surface = surface;
    }

    pub fn set_content_policy(&mut self, policy: ContentPolicy) {
        self.policy = policy;
    }

    pub fn backend(&self) -> &Arc<dyn IsolationBackend> {
        &self.backend
    }

    /// Builds an unstarted sandbox: UI-capable when the manifest declares
    /// a `ui` entry, background-only otherwise.
    pub fn build(&self, manifest: &PluginManifest, router: InboundRouter) -> Box<dyn Sandbox> {
        let instance = self.next_instance.fetch_add(1, Ordering::SeqCst);
        match &manifest.ui {
            Some(ui_entry) => {
                let core = SandboxCore::new(
                    &manifest.id,
                    instance,
                    SandboxKind::Ui,
                    Some(self.policy.clone()),
                    Arc::clone(&self.backend),
                    router,
                    self.timeouts.clone(),
                );
                Box::new(UiSandbox::new(
                    core,
                    Arc::clone(&self.surface),
                    ui_entry.clone(),
                    self.policy.clone(),
                ))
            }
            None => {
                let core = SandboxCore::new(
                    &manifest.id,
                    instance,
                    SandboxKind::Background,
                    None,
                    Arc::clone(&self.backend),
                    router,
                    self.timeouts.clone(),
                );
                Box::new(BackgroundSandbox::new(core))
            }
        }
    }

    /// Builds, creates and loads a sandbox for `manifest`.
    pub async fn spawn(
        &self,
        manifest: &PluginManifest,
        router: InboundRouter,
    ) -> HostResult<Box<dyn Sandbox>> {
        let mut sandbox = self.build(manifest, router);
        sandbox.create().await?;
        sandbox.load(&manifest.main).await?;
        Ok(sandbox)
    }
}
