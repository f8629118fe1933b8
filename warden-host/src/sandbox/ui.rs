//! UI-capable sandbox: a background sandbox plus a visual surface that the
//! host shell attaches and detaches.

use super::shared::SandboxCore;
use super::{ContentPolicy, Sandbox, SandboxKind};
use crate::error::HostResult;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// The host shell that renders plugin surfaces.
pub trait SurfaceHost: Send + Sync {
    /// Makes the plugin's surface visible.
    fn attach(&self, plugin_id: &str, ui_entry: &str, policy: &ContentPolicy);

    fn detach(&self, plugin_id: &str);
}

/// A surface host for environments without a display.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessSurface;

impl SurfaceHost for HeadlessSurface {
    fn attach(&self, plugin_id: &str, ui_entry: &str, _policy: &ContentPolicy) {
        debug!(plugin_id = %plugin_id, ui_entry = %ui_entry, "headless surface attached");
    }

    fn detach(&self, plugin_id: &str) {
        debug!(plugin_id = %plugin_id, "headless surface detached");
    }
}

pub struct UiSandbox {
    core: SandboxCore,
    surface: Arc<dyn SurfaceHost>,
    ui_entry: String,
    policy: ContentPolicy,
    visible: AtomicBool,
}

impl UiSandbox {
    pub(crate) fn new(
        core: SandboxCore,
        surface: Arc<dyn SurfaceHost>,
        ui_entry: String,
        policy: ContentPolicy,
    ) -> Self {
        Self {
            core,
            surface,
            ui_entry,
            policy,
            visible: AtomicBool::new(false),
        }
    }

    pub fn ui_entry(&self) -> &str {
        &self.ui_entry
    }
}

#[async_trait]
impl Sandbox for UiSandbox {
    fn plugin_id(&self) -> &str {
        self.core.plugin_id()
    }

    fn kind(&self) -> SandboxKind {
        SandboxKind::Ui
    }

    fn instance(&self) -> u64 {
        self.core.instance()
    }

    async fn create(&mut self) -> HostResult<()> {
        self.core.create()
    }

    async fn load(&mut self, entry_point: &str) -> HostResult<()> {
        self.core.load(entry_point).await
    }

    async fn send_call(&self, method: &str, args: Vec<Value>) -> HostResult<Value> {
        self.core.send_call(method, args).await
    }

    fn destroy(&self) {
        let _ = self.hide();
        self.core.destroy();
    }

    fn is_destroyed(&self) -> bool {
        self.core.is_destroyed()
    }

    fn pending_calls(&self) -> usize {
        self.core.pending_calls()
    }

    fn show(&self) -> HostResult<()> {
        if self.core.is_destroyed() {
            return Err(self.core.destroyed_error());
        }
        if !self.visible.swap(true, Ordering::SeqCst) {
            self.surface
                .attach(self.core.plugin_id(), &self.ui_entry, &self.policy);
        }
        Ok(())
    }

    fn hide(&self) -> HostResult<()> {
        if self.visible.swap(false, Ordering::SeqCst) {
            self.surface.detach(self.core.plugin_id());
        }
        Ok(())
    }

    fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }
}
