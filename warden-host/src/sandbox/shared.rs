//! State and behaviour shared by both sandbox variants.

use super::channel::{Channel, InboundRouter};
use super::isolate::{IsolateRequest, IsolationBackend, Isolate};
use super::{ContentPolicy, SandboxKind};
use crate::config::TimeoutConfig;
use crate::error::{HostResult, PluginHostError};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

pub(crate) struct SandboxCore {
    plugin_id: String,
    instance: u64,
    kind: SandboxKind,
    policy: Option<ContentPolicy>,
    backend: Arc<dyn IsolationBackend>,
    router: InboundRouter,
    timeouts: TimeoutConfig,
    isolate: Mutex<Option<Box<dyn Isolate>>>,
    channel: Option<Channel>,
    destroyed: AtomicBool,
}

impl SandboxCore {
    pub(crate) fn new(
        plugin_id: &str,
        instance: u64,
        kind: SandboxKind,
        policy: Option<ContentPolicy>,
        backend: Arc<dyn IsolationBackend>,
        router: InboundRouter,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            instance,
            kind,
            policy,
            backend,
            router,
            timeouts,
            isolate: Mutex::new(None),
            channel: None,
            destroyed: AtomicBool::new(false),
        }
    }

    pub(crate) fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub(crate) fn instance(&self) -> u64 {
        self.instance
    }

    pub(crate) fn kind(&self) -> SandboxKind {
        self.kind
    }

    fn creation_error(&self, reason: impl Into<String>) -> PluginHostError {
        PluginHostError::SandboxCreation {
            plugin_id: self.plugin_id.clone(),
            reason: reason.into(),
        }
    }

    pub(crate) fn destroyed_error(&self) -> PluginHostError {
        PluginHostError::SandboxDestroyed {
            plugin_id: self.plugin_id.clone(),
        }
    }

    pub(crate) fn create(&mut self) -> HostResult<()> {
        if self.is_destroyed() {
            return Err(self.destroyed_error());
        }
        let slot = self.isolate.get_mut().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }

        let request = IsolateRequest {
            plugin_id: self.plugin_id.clone(),
            kind: self.kind,
            policy: self.policy.clone(),
        };
        *slot = Some(self.backend.allocate(&request)?);
        debug!(
            plugin_id = %self.plugin_id,
            backend = self.backend.name(),
            kind = %self.kind,
            "isolate allocated"
        );
        Ok(())
    }

    /// Launches `entry_point` and waits for the plugin's `ready`. Any
    /// failure tears the sandbox down.
    pub(crate) async fn load(&mut self, entry_point: &str) -> HostResult<()> {
        if self.is_destroyed() {
            return Err(self.destroyed_error());
        }
        if self.channel.is_some() {
            return Err(self.creation_error("sandbox is already loaded"));
        }

        let launched = self
            .isolate
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .map(|isolate| isolate.launch(entry_point));
        let Some(launched) = launched else {
            return Err(self.creation_error("load called before create"));
        };
        let conduit = match launched {
            Ok(conduit) => conduit,
            Err(e) => {
                self.destroy();
                return Err(e);
            }
        };

        let (channel, ready) =
            Channel::open(&self.plugin_id, self.instance, conduit, self.router.clone());
        self.channel = Some(channel);

        match tokio::time::timeout(self.timeouts.load(), ready).await {
            Ok(Ok(())) => {
                info!(plugin_id = %self.plugin_id, kind = %self.kind, "sandbox ready");
                Ok(())
            }
            Ok(Err(_)) => {
                self.destroy();
                Err(self.creation_error("plugin exited before signalling ready"))
            }
            Err(_) => {
                self.destroy();
                Err(PluginHostError::LoadTimeout {
                    plugin_id: self.plugin_id.clone(),
                    timeout_ms: self.timeouts.load_ms,
                })
            }
        }
    }

    pub(crate) async fn send_call(&self, method: &str, args: Vec<Value>) -> HostResult<Value> {
        match &self.channel {
            Some(channel) if !self.is_destroyed() => {
                channel.call(method, args, self.timeouts.call()).await
            }
            Some(_) => Err(self.destroyed_error()),
            None => Err(self.creation_error("sandbox is not loaded")),
        }
    }

    pub(crate) fn pending_calls(&self) -> usize {
        self.channel.as_ref().map_or(0, Channel::pending_len)
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Synchronous teardown. Pending calls are rejected with
    /// `SandboxDestroyed` before the isolate is terminated.
    pub(crate) fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(channel) = &self.channel {
            channel.close();
        }
        let isolate = self
            .isolate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut isolate) = isolate {
            isolate.terminate();
        }
        info!(plugin_id = %self.plugin_id, instance = self.instance, "sandbox destroyed");
    }
}

impl Drop for SandboxCore {
    fn drop(&mut self) {
        self.destroy();
    }
}
