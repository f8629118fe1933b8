//! Plugin manager: owns every registered plugin and drives its lifecycle.
//!
//! The manager holds the registry of descriptors, the running contexts
//! (one sandbox each), and the shared permission, bridge and boundary
//! components. All orchestration happens through `&mut self`; sandboxes and
//! the error boundary report asynchronous conditions back as [`Notice`]s.

use crate::boundary::{ErrorBoundary, ErrorRecord};
use crate::bridge::{ApiBridge, CapabilityProvider};
use crate::config::HostConfig;
use crate::consent::ConsentProvider;
use crate::descriptor::{PluginDescriptor, PluginStatus};
use crate::error::{HostResult, PluginHostError};
use crate::events::{EventBus, HostEvent};
use crate::manifest::PluginManifest;
use crate::monitor::CallStats;
use crate::notice::{Notice, NoticeReceiver, NoticeSender, notice_channel};
use crate::permissions::{CapabilityCatalog, PermissionManager};
use crate::resolver::resolve_load_order;
use crate::sandbox::{InboundRouter, IsolationBackend, Sandbox, SandboxManager, SurfaceHost};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use warden_protocol::lifecycle;

/// A loaded plugin: its sandbox and everything resolved for it.
struct PluginContext {
    manifest: PluginManifest,
    sandbox: Box<dyn Sandbox>,
    granted: Vec<String>,
}

pub struct PluginManager {
    config: HostConfig,
    registry: HashMap<String, PluginDescriptor>,
    contexts: HashMap<String, PluginContext>,
    /// Loaded plugin ids in load order, for orderly shutdown.
    load_order: Vec<String>,
    permissions: Arc<PermissionManager>,
    bridge: ApiBridge,
    sandboxes: SandboxManager,
    boundary: Arc<ErrorBoundary>,
    events: EventBus,
    notice_tx: NoticeSender,
    notice_rx: NoticeReceiver,
}

impl PluginManager {
    pub fn new(
        config: HostConfig,
        backend: Arc<dyn IsolationBackend>,
        consent: Arc<dyn ConsentProvider>,
    ) -> Self {
        let events = EventBus::new();
        let (notice_tx, notice_rx) = notice_channel();
        let permissions = Arc::new(PermissionManager::new(
            CapabilityCatalog::with_policy(&config.permissions),
            consent,
        ));
        let boundary = Arc::new(ErrorBoundary::new(
            config.boundary.clone(),
            events.clone(),
            notice_tx.clone(),
        ));

        Self {
            bridge: ApiBridge::new(Arc::clone(&permissions)),
            sandboxes: SandboxManager::new(backend, config.timeouts.clone()),
            config,
            registry: HashMap::new(),
            contexts: HashMap::new(),
            load_order: Vec::new(),
            permissions,
            boundary,
            events,
            notice_tx,
            notice_rx,
        }
    }

    /// Sets the shell that renders UI-capable plugins.
    pub fn with_surface_host(mut self, surface: Arc<dyn SurfaceHost>) -> Self {
        self.sandboxes.set_surface_host(surface);
        self
    }

    /// Exposes a host capability to plugins.
    pub fn register_provider(&self, provider: Arc<dyn CapabilityProvider>) {
        self.bridge.register_provider(provider);
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn permissions(&self) -> &PermissionManager {
        &self.permissions
    }

    pub fn boundary(&self) -> &ErrorBoundary {
        &self.boundary
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    // ================================================================
    // Registration
    // ================================================================

    pub fn register(&mut self, manifest: PluginManifest) -> HostResult<()> {
        let descriptor = PluginDescriptor::new(manifest)?;
        let plugin_id = descriptor.id().to_string();
        if self.registry.contains_key(&plugin_id) {
            return Err(PluginHostError::DuplicateId(plugin_id));
        }
        info!(plugin_id = %plugin_id, version = %descriptor.version(), "Plugin registered");
        self.registry.insert(plugin_id.clone(), descriptor);
        self.events
            .emit(HostEvent::status(&plugin_id, PluginStatus::Registered.as_str()));
        Ok(())
    }

    /// Stores the configuration handed to the plugin at `initialize`.
    pub fn configure(&mut self, plugin_id: &str, config: Value) -> HostResult<()> {
        self.descriptor_mut(plugin_id)?.set_config(config);
        Ok(())
    }

    // ================================================================
    // Lifecycle
    // ================================================================

    /// Loads `plugin_id` and any dependencies that are not loaded yet.
    ///
    /// Dependency resolution failures leave every status untouched. A
    /// failure while loading a plugin leaves that plugin `crashed`.
    pub async fn load(&mut self, plugin_id: &str) -> HostResult<()> {
        let order = resolve_load_order(plugin_id, &self.registry)?;
        for id in order {
            if self.contexts.contains_key(&id) {
                continue;
            }
            self.load_one(&id).await?;
        }
        Ok(())
    }

    async fn load_one(&mut self, plugin_id: &str) -> HostResult<()> {
        self.set_status(plugin_id, PluginStatus::Loading, "load")?;
        info!(plugin_id = %plugin_id, "Loading plugin");

        match self.start(plugin_id).await {
            Ok(context) => {
                self.contexts.insert(plugin_id.to_string(), context);
                self.load_order.push(plugin_id.to_string());
                self.set_status(plugin_id, PluginStatus::Active, "load")?;
                info!(plugin_id = %plugin_id, "Plugin active");
                self.process_notices().await;
                Ok(())
            }
            Err(e) => {
                warn!(plugin_id = %plugin_id, "Plugin failed to load: {}", e);
                self.permissions.revoke(plugin_id, None).await;
                self.crash(plugin_id, &e);
                self.process_notices().await;
                Err(e)
            }
        }
    }

    /// Permission check, sandbox, `initialize`, `activate`, surface.
    async fn start(&self, plugin_id: &str) -> HostResult<PluginContext> {
        let descriptor = self.descriptor(plugin_id)?;
        let manifest = descriptor.manifest().clone();
        let config = descriptor.config().clone();

        let granted = self.permissions.check_permissions(&manifest).await?;

        let api = self.bridge.create_api(&manifest);
        let router = InboundRouter::new(
            api,
            Arc::clone(&self.boundary),
            self.events.clone(),
            self.notice_tx.clone(),
        )
        .with_call_limit(self.config.sandbox.max_inbound_calls);
        let sandbox = self.sandboxes.spawn(&manifest, router).await?;

        let started: HostResult<()> = async {
            self.boundary
                .wrap(
                    plugin_id,
                    lifecycle::INITIALIZE,
                    sandbox.send_call(lifecycle::INITIALIZE, vec![config, json!(granted)]),
                )
                .await?;
            self.boundary
                .wrap(
                    plugin_id,
                    lifecycle::ACTIVATE,
                    sandbox.send_call(lifecycle::ACTIVATE, vec![]),
                )
                .await?;
            if manifest.has_ui() {
                sandbox.show()?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = started {
            sandbox.destroy();
            return Err(e);
        }

        Ok(PluginContext {
            manifest,
            sandbox,
            granted,
        })
    }

    /// Resumes a deactivated plugin. A no-op on an active one.
    pub async fn activate(&mut self, plugin_id: &str) -> HostResult<()> {
        match self.status_of(plugin_id)? {
            PluginStatus::Active => return Ok(()),
            PluginStatus::Deactivated => {}
            status => return Err(invalid_state(plugin_id, status, "activate")),
        }

        let result = {
            let context = self.context(plugin_id)?;
            self.boundary
                .wrap(
                    plugin_id,
                    lifecycle::ACTIVATE,
                    context.sandbox.send_call(lifecycle::ACTIVATE, vec![]),
                )
                .await
                .and_then(|_| {
                    if context.manifest.has_ui() {
                        context.sandbox.show()?;
                    }
                    Ok(())
                })
        };

        if let Err(e) = result {
            self.process_notices().await;
            return Err(e);
        }
        self.set_status(plugin_id, PluginStatus::Active, "activate")?;
        info!(plugin_id = %plugin_id, "Plugin activated");
        Ok(())
    }

    /// Suspends an active plugin. A no-op on a deactivated one.
    ///
    /// The plugin is told to deactivate and its surface is hidden. An error
    /// from the plugin is logged but does not keep it active.
    pub async fn deactivate(&mut self, plugin_id: &str) -> HostResult<()> {
        match self.status_of(plugin_id)? {
            PluginStatus::Deactivated => return Ok(()),
            PluginStatus::Active => {}
            status => return Err(invalid_state(plugin_id, status, "deactivate")),
        }

        {
            let context = self.context(plugin_id)?;
            let result = self
                .boundary
                .wrap(
                    plugin_id,
                    lifecycle::DEACTIVATE,
                    context.sandbox.send_call(lifecycle::DEACTIVATE, vec![]),
                )
                .await;
            if let Err(e) = result {
                warn!(plugin_id = %plugin_id, "deactivate() failed: {}", e);
            }
            if context.manifest.has_ui() {
                let _ = context.sandbox.hide();
            }
        }

        self.set_status(plugin_id, PluginStatus::Deactivated, "deactivate")?;
        info!(plugin_id = %plugin_id, "Plugin deactivated");
        self.process_notices().await;
        Ok(())
    }

    /// Deactivation triggered by a failure storm. The plugin gets the
    /// cleanup deadline to acknowledge and is deactivated either way.
    async fn force_deactivate(&mut self, plugin_id: &str) {
        if self.status_of(plugin_id).ok() != Some(PluginStatus::Active) {
            return;
        }
        if let Ok(context) = self.context(plugin_id) {
            let deadline = self.config.timeouts.cleanup();
            let call = context.sandbox.send_call(lifecycle::DEACTIVATE, vec![]);
            match tokio::time::timeout(deadline, call).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!(plugin_id = %plugin_id, "forced deactivate() failed: {}", e),
                Err(_) => debug!(plugin_id = %plugin_id, "forced deactivate() timed out"),
            }
            if context.manifest.has_ui() {
                let _ = context.sandbox.hide();
            }
        }
        if self
            .set_status(plugin_id, PluginStatus::Deactivated, "deactivate")
            .is_ok()
        {
            warn!(plugin_id = %plugin_id, "Plugin forcibly deactivated");
        }
    }

    /// Pushes new configuration, storing it for future loads as well.
    pub async fn update_config(&mut self, plugin_id: &str, config: Value) -> HostResult<()> {
        self.descriptor_mut(plugin_id)?.set_config(config.clone());

        let result = match self.contexts.get(plugin_id) {
            Some(context) => self
                .boundary
                .wrap(
                    plugin_id,
                    lifecycle::UPDATE_CONFIG,
                    context
                        .sandbox
                        .send_call(lifecycle::UPDATE_CONFIG, vec![config]),
                )
                .await
                .map(|_| ()),
            None => Ok(()),
        };
        self.process_notices().await;
        result
    }

    /// Unloads a plugin: best-effort `cleanup`, sandbox teardown, grants
    /// cleared. Unloading an unloaded plugin is a no-op.
    pub async fn unload(&mut self, plugin_id: &str) -> HostResult<()> {
        match self.status_of(plugin_id)? {
            PluginStatus::Unloaded => return Ok(()),
            PluginStatus::Loading => {
                return Err(invalid_state(plugin_id, PluginStatus::Loading, "unload"));
            }
            _ => {}
        }

        if let Some(context) = self.contexts.remove(plugin_id) {
            let deadline = self.config.timeouts.cleanup();
            let call = context.sandbox.send_call(lifecycle::CLEANUP, vec![]);
            match tokio::time::timeout(deadline, call).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(plugin_id = %plugin_id, "cleanup() failed during unload: {}", e),
                Err(_) => warn!(plugin_id = %plugin_id, "cleanup() timed out during unload"),
            }
            context.sandbox.destroy();
        }
        self.load_order.retain(|id| id != plugin_id);
        self.permissions.revoke(plugin_id, None).await;
        self.boundary.clear(plugin_id).await;

        self.set_status(plugin_id, PluginStatus::Unloaded, "unload")?;
        info!(plugin_id = %plugin_id, "Plugin unloaded");
        Ok(())
    }

    /// Unloads every loaded plugin, most recently loaded first.
    pub async fn shutdown(&mut self) {
        let ids: Vec<String> = self.load_order.iter().rev().cloned().collect();
        for id in ids {
            if let Err(e) = self.unload(&id).await {
                warn!(plugin_id = %id, "unload failed during shutdown: {}", e);
            }
        }
    }

    // ================================================================
    // Calls
    // ================================================================

    /// Calls `method` on a loaded plugin under the default call timeout.
    pub async fn call(&mut self, plugin_id: &str, method: &str, args: Vec<Value>) -> HostResult<Value> {
        let result = {
            let context = self.context(plugin_id)?;
            self.boundary
                .wrap(plugin_id, method, context.sandbox.send_call(method, args))
                .await
        };
        self.process_notices().await;
        result
    }

    /// Like [`call`](Self::call) but fails with `ExecutionTimeout` once
    /// `budget` elapses.
    pub async fn call_with_budget(
        &mut self,
        plugin_id: &str,
        method: &str,
        args: Vec<Value>,
        budget: Duration,
    ) -> HostResult<Value> {
        let result = {
            let context = self.context(plugin_id)?;
            let call = async {
                match tokio::time::timeout(budget, context.sandbox.send_call(method, args)).await {
                    Ok(result) => result,
                    Err(_) => Err(PluginHostError::ExecutionTimeout {
                        plugin_id: plugin_id.to_string(),
                        method: method.to_string(),
                        budget_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
                    }),
                }
            };
            self.boundary.wrap(plugin_id, method, call).await
        };
        self.process_notices().await;
        result
    }

    // ================================================================
    // Notices
    // ================================================================

    /// Applies every notice that has already arrived.
    pub async fn process_notices(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(notice) = self.notice_rx.try_recv() {
            self.apply_notice(notice).await;
            handled += 1;
        }
        handled
    }

    /// Waits for the next notice, applies it and returns it.
    ///
    /// Not cancel-safe: a notice taken off the queue is lost if the future
    /// is dropped while it is being applied. Inside `select!`, wait on
    /// [`next_notice`](Self::next_notice) and apply the result afterwards.
    pub async fn handle_next_notice(&mut self) -> Option<Notice> {
        let notice = self.next_notice().await?;
        self.apply_notice(notice.clone()).await;
        Some(notice)
    }

    /// Waits for the next notice without applying it. Cancel-safe.
    pub async fn next_notice(&mut self) -> Option<Notice> {
        self.notice_rx.recv().await
    }

    /// Reacts to a notice: crashes a terminated plugin or force-deactivates
    /// one caught in a failure storm.
    pub async fn apply_notice(&mut self, notice: Notice) {
        match notice {
            Notice::Terminated {
                plugin_id,
                instance,
                reason,
            } => {
                let current = self
                    .contexts
                    .get(&plugin_id)
                    .map(|context| context.sandbox.instance());
                if current != Some(instance) {
                    debug!(plugin_id = %plugin_id, instance, "ignoring notice for stale sandbox");
                    return;
                }
                if let Some(context) = self.contexts.remove(&plugin_id) {
                    context.sandbox.destroy();
                }
                self.load_order.retain(|id| id != &plugin_id);
                self.permissions.revoke(&plugin_id, None).await;

                let error = PluginHostError::Channel {
                    plugin_id: plugin_id.clone(),
                    message: reason,
                };
                warn!(plugin_id = %plugin_id, "Plugin crashed: {}", error);
                self.crash(&plugin_id, &error);
            }
            Notice::FailureStorm { plugin_id, errors } => {
                debug!(plugin_id = %plugin_id, errors, "handling failure storm");
                self.force_deactivate(&plugin_id).await;
            }
        }
    }

    // ================================================================
    // Queries
    // ================================================================

    pub fn descriptor(&self, plugin_id: &str) -> HostResult<&PluginDescriptor> {
        self.registry
            .get(plugin_id)
            .ok_or_else(|| PluginHostError::PluginNotFound(plugin_id.to_string()))
    }

    pub fn status(&self, plugin_id: &str) -> Option<PluginStatus> {
        self.registry.get(plugin_id).map(PluginDescriptor::status)
    }

    /// Every registered plugin, ordered by id.
    pub fn list(&self) -> Vec<&PluginDescriptor> {
        let mut descriptors: Vec<&PluginDescriptor> = self.registry.values().collect();
        descriptors.sort_by(|a, b| a.id().cmp(b.id()));
        descriptors
    }

    pub fn is_loaded(&self, plugin_id: &str) -> bool {
        self.contexts.contains_key(plugin_id)
    }

    pub fn is_visible(&self, plugin_id: &str) -> bool {
        self.contexts
            .get(plugin_id)
            .is_some_and(|context| context.sandbox.is_visible())
    }

    /// Capabilities granted when the running context was loaded.
    pub fn loaded_permissions(&self, plugin_id: &str) -> Option<&[String]> {
        self.contexts
            .get(plugin_id)
            .map(|context| context.granted.as_slice())
    }

    /// Capabilities currently granted, reflecting revocations.
    pub async fn granted_permissions(&self, plugin_id: &str) -> Vec<String> {
        self.permissions.granted(plugin_id).await
    }

    pub async fn revoke_permission(&self, plugin_id: &str, capability: Option<&str>) -> bool {
        self.permissions.revoke(plugin_id, capability).await
    }

    pub async fn metrics(&self, plugin_id: &str) -> Option<CallStats> {
        self.boundary.monitor().snapshot(plugin_id).await
    }

    pub async fn error_records(&self, plugin_id: &str) -> Vec<ErrorRecord> {
        self.boundary.records(plugin_id).await
    }

    // ================================================================
    // Internals
    // ================================================================

    fn descriptor_mut(&mut self, plugin_id: &str) -> HostResult<&mut PluginDescriptor> {
        self.registry
            .get_mut(plugin_id)
            .ok_or_else(|| PluginHostError::PluginNotFound(plugin_id.to_string()))
    }

    fn status_of(&self, plugin_id: &str) -> HostResult<PluginStatus> {
        self.descriptor(plugin_id).map(PluginDescriptor::status)
    }

    /// The context of a loaded plugin.
    fn context(&self, plugin_id: &str) -> HostResult<&PluginContext> {
        let status = self.status_of(plugin_id)?;
        self.contexts
            .get(plugin_id)
            .ok_or_else(|| invalid_state(plugin_id, status, "call"))
    }

    fn set_status(
        &mut self,
        plugin_id: &str,
        next: PluginStatus,
        operation: &'static str,
    ) -> HostResult<()> {
        self.descriptor_mut(plugin_id)?.transition(next, operation)?;
        self.events.emit(HostEvent::status(plugin_id, next.as_str()));
        Ok(())
    }

    fn crash(&mut self, plugin_id: &str, error: &PluginHostError) {
        if let Some(descriptor) = self.registry.get_mut(plugin_id) {
            descriptor.mark_crashed(error);
            let status = descriptor.status();
            self.events.emit(HostEvent::status(plugin_id, status.as_str()));
        }
    }
}

fn invalid_state(plugin_id: &str, status: PluginStatus, operation: &'static str) -> PluginHostError {
    PluginHostError::InvalidState {
        plugin_id: plugin_id.to_string(),
        status: status.to_string(),
        operation,
    }
}
