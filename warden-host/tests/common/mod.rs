//! Shared fixtures: manifests, in-process guests, and a manager factory.
#![allow(dead_code)]

use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use warden_host::sandbox::GuestIo;
use warden_host::*;
use warden_plugin_sdk::prelude::*;
use warden_protocol::{Envelope, read_envelope, write_envelope};

pub const WORKER: &str = "worker.js";
pub const NEVER_READY: &str = "never-ready.js";
pub const SILENT: &str = "silent.js";
pub const DOUBLE_REPLY: &str = "double-reply.js";
pub const EXITS_AFTER_READY: &str = "exits-after-ready.js";
pub const FAILS_INIT: &str = "fails-init.js";
pub const STORMS_ON_ACTIVATE: &str = "storms-on-activate.js";
pub const DEAF: &str = "deaf.js";
pub const FLOOD: &str = "flood.js";

pub fn manifest(id: &str, main: &str, permissions: &[&str]) -> PluginManifest {
    PluginManifest {
        id: id.into(),
        name: format!("Plugin {id}"),
        version: "1.0.0".into(),
        main: main.into(),
        ui: None,
        description: None,
        permissions: permissions.iter().map(|p| p.to_string()).collect(),
        dependencies: BTreeMap::new(),
    }
}

pub fn ui_manifest(id: &str, main: &str, permissions: &[&str]) -> PluginManifest {
    PluginManifest {
        ui: Some("panel.html".into()),
        ..manifest(id, main, permissions)
    }
}

pub fn with_dependency(mut manifest: PluginManifest, id: &str, range: &str) -> PluginManifest {
    manifest.dependencies.insert(id.into(), range.into());
    manifest
}

// ================================================================
// SDK guest
// ================================================================

/// Lifecycle counters shared between a test and its worker guests.
#[derive(Debug, Default)]
pub struct Counters {
    pub initialized: AtomicUsize,
    pub activated: AtomicUsize,
    pub deactivated: AtomicUsize,
    pub cleaned_up: AtomicUsize,
}

impl Counters {
    pub fn initialized(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn activated(&self) -> usize {
        self.activated.load(Ordering::SeqCst)
    }

    pub fn deactivated(&self) -> usize {
        self.deactivated.load(Ordering::SeqCst)
    }

    pub fn cleaned_up(&self) -> usize {
        self.cleaned_up.load(Ordering::SeqCst)
    }
}

/// A well-behaved plugin with a few test methods.
pub struct Worker {
    counters: Arc<Counters>,
}

#[async_trait]
impl Plugin for Worker {
    async fn initialize(
        &self,
        _host: &HostHandle,
        config: Value,
        permissions: Vec<String>,
    ) -> Result<Value, String> {
        self.counters.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "config": config, "permissions": permissions }))
    }

    async fn activate(&self, _host: &HostHandle) -> Result<Value, String> {
        self.counters.activated.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Null)
    }

    async fn deactivate(&self, _host: &HostHandle) -> Result<Value, String> {
        self.counters.deactivated.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Null)
    }

    async fn update_config(&self, host: &HostHandle, config: Value) -> Result<Value, String> {
        host.emit("config", config).await.map_err(|e| e.to_string())?;
        Ok(Value::Null)
    }

    async fn cleanup(&self, _host: &HostHandle) -> Result<Value, String> {
        self.counters.cleaned_up.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Null)
    }

    async fn handle_call(
        &self,
        host: &HostHandle,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, String> {
        match method {
            "echo" => Ok(json!(args)),
            "fail" => Err("boom".into()),
            "sleep" => {
                let ms = args.first().and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!(ms))
            }
            "host" => {
                let target = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or("missing host method")?
                    .to_string();
                host.call(&target, args.into_iter().skip(1).collect())
                    .await
                    .map_err(|e| e.to_string())
            }
            "emit" => {
                host.emit("ping", json!({ "n": 1 })).await.map_err(|e| e.to_string())?;
                Ok(Value::Null)
            }
            "report" => {
                host.report_error("self-reported").await.map_err(|e| e.to_string())?;
                Ok(Value::Null)
            }
            _ => Err(format!("unknown method: {method}")),
        }
    }
}

/// Fails `initialize`.
struct BrokenInit;

#[async_trait]
impl Plugin for BrokenInit {
    async fn initialize(
        &self,
        _host: &HostHandle,
        _config: Value,
        _permissions: Vec<String>,
    ) -> Result<Value, String> {
        Err("cannot start".into())
    }
}

/// Reports more errors than the boundary tolerates while activating.
struct StormOnActivate;

#[async_trait]
impl Plugin for StormOnActivate {
    async fn activate(&self, host: &HostHandle) -> Result<Value, String> {
        for n in 0..11 {
            host.report_error(&format!("activation failure {n}"))
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(Value::Null)
    }
}

// ================================================================
// Raw guests
// ================================================================

/// Reads frames without ever answering or signalling ready.
async fn never_ready(mut io: GuestIo) {
    let mut sink = Vec::new();
    let _ = io.reader.read_to_end(&mut sink).await;
}

/// Signals ready, then swallows every call.
async fn silent(mut io: GuestIo) {
    let _ = write_envelope(&mut io.writer, &Envelope::Ready).await;
    while read_envelope(&mut io.reader).await.is_ok() {}
}

/// Answers every call twice.
async fn double_reply(mut io: GuestIo) {
    let _ = write_envelope(&mut io.writer, &Envelope::Ready).await;
    while let Ok(envelope) = read_envelope(&mut io.reader).await {
        if let Envelope::Call { id, .. } = envelope {
            let _ = write_envelope(&mut io.writer, &Envelope::ok(id.clone(), json!("first"))).await;
            let _ = write_envelope(&mut io.writer, &Envelope::ok(id, json!("second"))).await;
        }
    }
}

/// Signals ready and answers `initialize`/`activate`, then exits on the
/// first custom call.
async fn exits_after_ready(mut io: GuestIo) {
    let _ = write_envelope(&mut io.writer, &Envelope::Ready).await;
    while let Ok(envelope) = read_envelope(&mut io.reader).await {
        if let Envelope::Call { id, method, .. } = envelope {
            if method == "exit" {
                return;
            }
            let _ = write_envelope(&mut io.writer, &Envelope::ok(id, Value::Null)).await;
        }
    }
}

/// Signals ready, then never reads from its channel again.
async fn deaf(mut io: GuestIo) {
    let _ = write_envelope(&mut io.writer, &Envelope::Ready).await;
    std::future::pending::<()>().await;
}

/// On `flood(n)`, fires `n` calls at `gauge.hold` without waiting in
/// between and answers with the number of replies it got back.
async fn flood(mut io: GuestIo) {
    let _ = write_envelope(&mut io.writer, &Envelope::Ready).await;
    while let Ok(envelope) = read_envelope(&mut io.reader).await {
        let Envelope::Call { id, method, args } = envelope else {
            continue;
        };
        if method != "flood" {
            let _ = write_envelope(&mut io.writer, &Envelope::ok(id, Value::Null)).await;
            continue;
        }

        let n = args.first().and_then(Value::as_u64).unwrap_or(0);
        for _ in 0..n {
            let (_, call) = Envelope::call("gauge.hold", vec![]);
            let _ = write_envelope(&mut io.writer, &call).await;
        }
        let mut replies = 0;
        while replies < n {
            match read_envelope(&mut io.reader).await {
                Ok(Envelope::Response { .. }) => replies += 1,
                Ok(_) => {}
                Err(_) => return,
            }
        }
        let _ = write_envelope(&mut io.writer, &Envelope::ok(id, json!(replies))).await;
    }
}

/// A backend with every test guest registered.
pub fn backend(counters: &Arc<Counters>) -> Arc<InProcessBackend> {
    let backend = InProcessBackend::new();

    let shared = Arc::clone(counters);
    backend.register(WORKER, move |io: GuestIo| {
        let worker = Worker {
            counters: Arc::clone(&shared),
        };
        async move {
            let _ = serve(worker, io.reader, io.writer).await;
        }
    });
    backend.register(FAILS_INIT, |io: GuestIo| async move {
        let _ = serve(BrokenInit, io.reader, io.writer).await;
    });
    backend.register(STORMS_ON_ACTIVATE, |io: GuestIo| async move {
        let _ = serve(StormOnActivate, io.reader, io.writer).await;
    });
    backend.register(NEVER_READY, never_ready);
    backend.register(SILENT, silent);
    backend.register(DOUBLE_REPLY, double_reply);
    backend.register(EXITS_AFTER_READY, exits_after_ready);
    backend.register(DEAF, deaf);
    backend.register(FLOOD, flood);

    Arc::new(backend)
}

pub fn host_with(
    config: HostConfig,
    consent: Arc<dyn ConsentProvider>,
) -> (PluginManager, Arc<InProcessBackend>, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let backend = backend(&counters);
    let manager = PluginManager::new(config, backend.clone(), consent);
    manager.register_provider(Arc::new(MemoryStorage::new()));
    (manager, backend, counters)
}

pub fn host() -> (PluginManager, Arc<InProcessBackend>, Arc<Counters>) {
    host_with(HostConfig::default(), Arc::new(StaticConsent::AllowAll))
}

/// Lets spawned guest and reader tasks run.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
