//! Background-only sandbox: no visual surface.

use super::shared::SandboxCore;
use super::{Sandbox, SandboxKind};
use crate::error::HostResult;
use async_trait::async_trait;
use serde_json::Value;

pub struct BackgroundSandbox {
    core: SandboxCore,
}

impl BackgroundSandbox {
    pub(crate) fn new(core: SandboxCore) -> Self {
        Self { core }
    }
}

#[async_trait]
impl Sandbox for BackgroundSandbox {
    fn plugin_id(&self) -> &str {
        self.core.plugin_id()
    }

    fn kind(&self) -> SandboxKind {
        SandboxKind::Background
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
        self.core.destroy();
    }

    fn is_destroyed(&self) -> bool {
        self.core.is_destroyed()
    }

    fn pending_calls(&self) -> usize {
        self.core.pending_calls()
    }
}
