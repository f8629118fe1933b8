//! End-to-end plugin lifecycles through `PluginManager` with in-process
//! guests.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_test::assert_ok;
use warden_host::events::{PLUGIN_ERROR, PLUGIN_STATUS};
use warden_host::*;

fn drain(events: &mut broadcast::Receiver<HostEvent>) -> Vec<HostEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn statuses(events: &[HostEvent], plugin_id: &str) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.name == PLUGIN_STATUS && e.plugin_id.as_deref() == Some(plugin_id))
        .filter_map(|e| e.data["status"].as_str().map(str::to_string))
        .collect()
}

// ================================================================
// Registration
// ================================================================

#[tokio::test]
async fn register_rejects_duplicate_id() {
    let (mut host, _, _) = host();
    host.register(manifest("acme.worker", WORKER, &[])).unwrap();

    let err = host
        .register(manifest("acme.worker", WORKER, &[]))
        .unwrap_err();
    assert!(matches!(err, PluginHostError::DuplicateId(id) if id == "acme.worker"));
}

#[tokio::test]
async fn register_rejects_invalid_manifest() {
    let (mut host, _, _) = host();
    let mut bad = manifest("acme.worker", WORKER, &[]);
    bad.name.clear();

    let err = host.register(bad).unwrap_err();
    assert_eq!(err.to_string(), "invalid manifest: name is required");
    assert!(host.list().is_empty());
}

#[tokio::test]
async fn list_is_sorted_by_id() {
    let (mut host, _, _) = host();
    host.register(manifest("zeta", WORKER, &[])).unwrap();
    host.register(manifest("alpha", WORKER, &[])).unwrap();

    let ids: Vec<&str> = host.list().iter().map(|d| d.id()).collect();
    assert_eq!(ids, vec!["alpha", "zeta"]);
    assert_eq!(host.status("alpha"), Some(PluginStatus::Registered));
}

// ================================================================
// Lifecycle
// ================================================================

#[tokio::test]
async fn full_lifecycle_ends_unloaded_without_grants() {
    let (mut host, backend, counters) = host();
    let mut events = host.subscribe();
    host.register(manifest("acme.worker", WORKER, &["storage.local"]))
        .unwrap();

    host.load("acme.worker").await.unwrap();
    assert_eq!(host.status("acme.worker"), Some(PluginStatus::Active));
    assert_eq!(host.granted_permissions("acme.worker").await, vec!["storage.local"]);
    assert_eq!(
        host.loaded_permissions("acme.worker"),
        Some(&["storage.local".to_string()][..])
    );
    assert_eq!((counters.initialized(), counters.activated()), (1, 1));

    host.deactivate("acme.worker").await.unwrap();
    assert_eq!(host.status("acme.worker"), Some(PluginStatus::Deactivated));
    host.activate("acme.worker").await.unwrap();
    host.deactivate("acme.worker").await.unwrap();

    host.unload("acme.worker").await.unwrap();
    assert_eq!(host.status("acme.worker"), Some(PluginStatus::Unloaded));
    assert!(host.granted_permissions("acme.worker").await.is_empty());
    assert!(!host.is_loaded("acme.worker"));
    assert_eq!(counters.cleaned_up(), 1);
    assert_eq!(counters.deactivated(), 2);
    assert_eq!(backend.live_instances(), 0);

    assert_eq!(
        statuses(&drain(&mut events), "acme.worker"),
        vec![
            "registered",
            "loading",
            "active",
            "deactivated",
            "active",
            "deactivated",
            "unloaded",
        ]
    );
}

#[tokio::test]
async fn activate_and_deactivate_are_idempotent() {
    let (mut host, _, counters) = host();
    host.register(manifest("acme.worker", WORKER, &[])).unwrap();
    host.load("acme.worker").await.unwrap();

    assert_ok!(host.activate("acme.worker").await);
    assert_eq!(counters.activated(), 1);

    host.deactivate("acme.worker").await.unwrap();
    host.deactivate("acme.worker").await.unwrap();
    assert_eq!(counters.deactivated(), 1);
}

#[tokio::test]
async fn activate_requires_a_loaded_plugin() {
    let (mut host, _, _) = host();
    host.register(manifest("acme.worker", WORKER, &[])).unwrap();

    let err = host.activate("acme.worker").await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "cannot activate plugin 'acme.worker' while registered"
    );

    let err = host.activate("acme.missing").await.unwrap_err();
    assert!(matches!(err, PluginHostError::PluginNotFound(_)));
}

#[tokio::test]
async fn unload_is_idempotent_and_reload_works() {
    let (mut host, backend, counters) = host();
    host.register(manifest("acme.worker", WORKER, &[])).unwrap();
    host.load("acme.worker").await.unwrap();

    host.unload("acme.worker").await.unwrap();
    host.unload("acme.worker").await.unwrap();
    assert_eq!(counters.cleaned_up(), 1);

    host.load("acme.worker").await.unwrap();
    assert_eq!(host.status("acme.worker"), Some(PluginStatus::Active));
    assert_eq!(counters.initialized(), 2);
    assert_eq!(backend.allocations(), 2);
    assert_eq!(backend.live_instances(), 1);
}

#[tokio::test]
async fn loading_an_active_plugin_is_a_no_op() {
    let (mut host, backend, _) = host();
    host.register(manifest("acme.worker", WORKER, &[])).unwrap();
    host.load("acme.worker").await.unwrap();
    host.load("acme.worker").await.unwrap();
    assert_eq!(backend.allocations(), 1);
}

#[tokio::test]
async fn shutdown_unloads_in_reverse_load_order() {
    let (mut host, _, counters) = host();
    host.register(manifest("acme.base", WORKER, &[])).unwrap();
    host.register(with_dependency(
        manifest("acme.top", WORKER, &[]),
        "acme.base",
        "^1",
    ))
    .unwrap();
    host.load("acme.top").await.unwrap();
    let mut events = host.subscribe();

    host.shutdown().await;

    let unloaded: Vec<String> = drain(&mut events)
        .into_iter()
        .filter(|e| e.data["status"] == "unloaded")
        .filter_map(|e| e.plugin_id)
        .collect();
    assert_eq!(unloaded, vec!["acme.top", "acme.base"]);
    assert_eq!(counters.cleaned_up(), 2);
}

// ================================================================
// Dependencies
// ================================================================

#[tokio::test]
async fn dependencies_load_first() {
    let (mut host, _, counters) = host();
    let mut events = host.subscribe();
    host.register(with_dependency(
        manifest("acme.top", WORKER, &[]),
        "acme.mid",
        "^1.0.0",
    ))
    .unwrap();
    host.register(with_dependency(
        manifest("acme.mid", WORKER, &[]),
        "acme.base",
        ">=1.0.0",
    ))
    .unwrap();
    host.register(manifest("acme.base", WORKER, &[])).unwrap();

    host.load("acme.top").await.unwrap();

    let activated: Vec<String> = drain(&mut events)
        .into_iter()
        .filter(|e| e.data["status"] == "active")
        .filter_map(|e| e.plugin_id)
        .collect();
    assert_eq!(activated, vec!["acme.base", "acme.mid", "acme.top"]);
    assert_eq!(counters.initialized(), 3);
}

#[tokio::test]
async fn unresolved_dependency_leaves_plugin_registered() {
    let (mut host, backend, _) = host();
    host.register(with_dependency(
        manifest("acme.q", WORKER, &[]),
        "acme.r",
        "^1.0.0",
    ))
    .unwrap();

    let err = host.load("acme.q").await.unwrap_err();
    assert!(
        matches!(&err, PluginHostError::UnresolvedDependency { dependency, .. } if dependency == "acme.r"),
        "got {err:?}"
    );
    assert_eq!(host.status("acme.q"), Some(PluginStatus::Registered));
    assert_eq!(backend.allocations(), 0);
}

#[tokio::test]
async fn dependency_version_mismatch_is_unresolved() {
    let (mut host, _, _) = host();
    host.register(manifest("acme.r", WORKER, &[])).unwrap();
    host.register(with_dependency(
        manifest("acme.q", WORKER, &[]),
        "acme.r",
        "^2",
    ))
    .unwrap();

    let err = host.load("acme.q").await.unwrap_err();
    assert_eq!(err.kind(), "UnresolvedDependency");
    assert_eq!(host.status("acme.r"), Some(PluginStatus::Registered));
}

#[tokio::test]
async fn failed_dependency_stops_the_chain() {
    let (mut host, _, _) = host();
    host.register(manifest("acme.base", FAILS_INIT, &[])).unwrap();
    host.register(with_dependency(
        manifest("acme.top", WORKER, &[]),
        "acme.base",
        "*",
    ))
    .unwrap();

    assert!(host.load("acme.top").await.is_err());
    assert_eq!(host.status("acme.base"), Some(PluginStatus::Crashed));
    assert_eq!(host.status("acme.top"), Some(PluginStatus::Registered));
}

// ================================================================
// Permissions
// ================================================================

#[tokio::test]
async fn refused_consent_denies_load_before_allocation() {
    let (mut host, backend, _) = host_with(HostConfig::default(), Arc::new(StaticConsent::DenyAll));
    host.register(manifest("acme.spy", WORKER, &["clipboard.read"]))
        .unwrap();

    let err = host.load("acme.spy").await.unwrap_err();
    assert!(
        matches!(&err, PluginHostError::PermissionDenied { permission, .. } if permission == "clipboard.read"),
        "got {err:?}"
    );
    assert_eq!(backend.allocations(), 0);
    assert_eq!(host.status("acme.spy"), Some(PluginStatus::Crashed));
    assert!(host.granted_permissions("acme.spy").await.is_empty());
}

#[tokio::test]
async fn consent_is_only_asked_for_sensitive_capabilities() {
    let asked = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&asked);
    let consent = ConsentFn(move |request: &ConsentRequest| {
        seen.fetch_add(1, Ordering::SeqCst);
        request.capabilities == vec!["location".to_string()]
    });
    let (mut host, _, _) = host_with(HostConfig::default(), Arc::new(consent));

    host.register(manifest("acme.plain", WORKER, &["storage.local", "events"]))
        .unwrap();
    host.load("acme.plain").await.unwrap();
    assert_eq!(asked.load(Ordering::SeqCst), 0);

    host.register(manifest("acme.map", WORKER, &["storage.local", "location"]))
        .unwrap();
    host.load("acme.map").await.unwrap();
    assert_eq!(asked.load(Ordering::SeqCst), 1);
    assert_eq!(
        host.granted_permissions("acme.map").await,
        vec!["location", "storage.local"]
    );
}

#[tokio::test]
async fn policy_denied_capability_fails_load() {
    let mut config = HostConfig::default();
    config.permissions.denied = vec!["network".into()];
    let (mut host, backend, _) = host_with(config, Arc::new(StaticConsent::AllowAll));
    host.register(manifest("acme.net", WORKER, &["network.fetch"]))
        .unwrap();

    let err = host.load("acme.net").await.unwrap_err();
    assert_eq!(err.kind(), "PermissionDenied");
    assert_eq!(backend.allocations(), 0);
}

#[tokio::test]
async fn unknown_capability_fails_load() {
    let (mut host, _, _) = host();
    host.register(manifest("acme.odd", WORKER, &["teleport"])).unwrap();

    let err = host.load("acme.odd").await.unwrap_err();
    assert_eq!(err.kind(), "UnknownCapability");
}

#[tokio::test]
async fn revoked_capability_is_enforced_on_next_call() {
    let (mut host, _, _) = host();
    host.register(manifest("acme.worker", WORKER, &["storage.local"]))
        .unwrap();
    host.load("acme.worker").await.unwrap();

    host.call(
        "acme.worker",
        "host",
        vec![json!("storage.set"), json!("k"), json!(1)],
    )
    .await
    .unwrap();

    assert!(host.revoke_permission("acme.worker", Some("storage.local")).await);
    let err = host
        .call("acme.worker", "host", vec![json!("storage.get"), json!("k")])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("permission denied"), "got {err}");
}

// ================================================================
// Calls and configuration
// ================================================================

#[tokio::test]
async fn call_requires_loaded_plugin() {
    let (mut host, _, _) = host();
    host.register(manifest("acme.worker", WORKER, &[])).unwrap();

    let err = host.call("acme.worker", "echo", vec![]).await.unwrap_err();
    assert_eq!(err.kind(), "InvalidState");
    let err = host.call("acme.none", "echo", vec![]).await.unwrap_err();
    assert_eq!(err.kind(), "PluginNotFound");
}

#[tokio::test]
async fn calls_are_measured() {
    let (mut host, _, _) = host();
    host.register(manifest("acme.worker", WORKER, &[])).unwrap();
    host.load("acme.worker").await.unwrap();

    host.call("acme.worker", "echo", vec![]).await.unwrap();
    let _ = host.call("acme.worker", "fail", vec![]).await;

    let stats = host.metrics("acme.worker").await.unwrap();
    // initialize, activate, echo, fail
    assert_eq!(stats.calls, 4);
    assert_eq!(stats.failures, 1);
    let records = host.error_records("acme.worker").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].method.as_deref(), Some("fail"));
}

#[tokio::test(start_paused = true)]
async fn budget_overrun_is_an_execution_timeout() {
    let (mut host, _, _) = host();
    host.register(manifest("acme.worker", WORKER, &[])).unwrap();
    host.load("acme.worker").await.unwrap();

    let err = host
        .call_with_budget(
            "acme.worker",
            "sleep",
            vec![json!(500)],
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, PluginHostError::ExecutionTimeout { budget_ms: 100, .. }),
        "got {err:?}"
    );

    let value = host
        .call_with_budget("acme.worker", "sleep", vec![json!(10)], Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(value, json!(10));
}

#[tokio::test]
async fn update_config_reaches_loaded_plugin() {
    let (mut host, _, _) = host();
    let mut events = host.subscribe();
    host.register(manifest("acme.worker", WORKER, &[])).unwrap();
    host.configure("acme.worker", json!({ "interval": 5 })).unwrap();
    host.load("acme.worker").await.unwrap();

    host.update_config("acme.worker", json!({ "interval": 10 }))
        .await
        .unwrap();

    let pushed: Vec<HostEvent> = drain(&mut events)
        .into_iter()
        .filter(|e| e.name == "plugin:acme.worker:config")
        .collect();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].data, json!({ "interval": 10 }));
    assert_eq!(
        host.descriptor("acme.worker").unwrap().config(),
        &json!({ "interval": 10 })
    );
}

#[tokio::test]
async fn update_config_before_load_is_stored() {
    let (mut host, _, _) = host();
    host.register(manifest("acme.worker", WORKER, &[])).unwrap();

    host.update_config("acme.worker", json!({ "a": 1 })).await.unwrap();
    assert_eq!(
        host.descriptor("acme.worker").unwrap().config(),
        &json!({ "a": 1 })
    );
}

// ================================================================
// Failure containment
// ================================================================

#[tokio::test(start_paused = true)]
async fn failure_storm_forces_deactivation_once() {
    let (mut host, _, counters) = host();
    let mut events = host.subscribe();
    host.register(manifest("acme.worker", WORKER, &[])).unwrap();
    host.load("acme.worker").await.unwrap();

    for _ in 0..10 {
        let _ = host.call("acme.worker", "fail", vec![]).await;
    }
    assert_eq!(host.status("acme.worker"), Some(PluginStatus::Active));

    let _ = host.call("acme.worker", "fail", vec![]).await;
    assert_eq!(host.status("acme.worker"), Some(PluginStatus::Deactivated));
    assert_eq!(counters.deactivated(), 1);

    // Still inside the window: no second storm
    let _ = host.call("acme.worker", "fail", vec![]).await;

    let storms: Vec<HostEvent> = drain(&mut events)
        .into_iter()
        .filter(|e| e.name == PLUGIN_ERROR)
        .collect();
    assert_eq!(storms.len(), 1);
    assert_eq!(storms[0].data["pluginId"], "acme.worker");
    assert_eq!(storms[0].data["errors"], 11);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(host.boundary().recent_errors("acme.worker").await, 0);

    host.activate("acme.worker").await.unwrap();
    let value = host.call("acme.worker", "echo", vec![json!("ok")]).await.unwrap();
    assert_eq!(value, json!(["ok"]));
    assert_eq!(host.status("acme.worker"), Some(PluginStatus::Active));
}

#[tokio::test]
async fn plugin_exit_marks_crashed_and_allows_reload() {
    let (mut host, backend, _) = host();
    host.register(manifest("acme.flaky", EXITS_AFTER_READY, &["storage.local"]))
        .unwrap();
    host.load("acme.flaky").await.unwrap();

    let err = host.call("acme.flaky", "exit", vec![]).await.unwrap_err();
    assert_eq!(err.kind(), "SandboxDestroyed");
    settle().await;
    host.process_notices().await;

    let descriptor = host.descriptor("acme.flaky").unwrap();
    assert_eq!(descriptor.status(), PluginStatus::Crashed);
    assert!(
        descriptor
            .last_error()
            .unwrap()
            .contains("channel closed by plugin")
    );
    assert!(host.granted_permissions("acme.flaky").await.is_empty());
    assert_eq!(backend.live_instances(), 0);

    host.load("acme.flaky").await.unwrap();
    assert_eq!(host.status("acme.flaky"), Some(PluginStatus::Active));
    assert!(host.descriptor("acme.flaky").unwrap().last_error().is_none());
}

#[tokio::test]
async fn failed_initialize_crashes_and_releases_sandbox() {
    let (mut host, backend, _) = host();
    host.register(manifest("acme.broken", FAILS_INIT, &["storage.local"]))
        .unwrap();

    let err = host.load("acme.broken").await.unwrap_err();
    assert_eq!(err.kind(), "PluginCallFailed");
    assert_eq!(host.status("acme.broken"), Some(PluginStatus::Crashed));
    assert!(host.granted_permissions("acme.broken").await.is_empty());
    assert_eq!(backend.live_instances(), 0);
}

#[tokio::test(start_paused = true)]
async fn plugin_that_stops_reading_times_out_during_load() {
    let (mut host, backend, _) = host();
    host.register(manifest("acme.deaf", DEAF, &[])).unwrap();
    // Larger than the channel buffer, so the write itself stalls
    host.configure("acme.deaf", json!({ "blob": "x".repeat(200 * 1024) }))
        .unwrap();

    let err = tokio::time::timeout(Duration::from_secs(120), host.load("acme.deaf"))
        .await
        .expect("load must honour the call timeout")
        .unwrap_err();
    assert_eq!(err.kind(), "MessageTimeout");
    assert_eq!(host.status("acme.deaf"), Some(PluginStatus::Crashed));
    assert!(!host.is_loaded("acme.deaf"));
    assert_eq!(backend.live_instances(), 0);
}

#[tokio::test]
async fn failure_storm_during_activate_is_applied_before_load_returns() {
    let (mut host, _, _) = host();
    let mut events = host.subscribe();
    host.register(manifest("acme.storm", STORMS_ON_ACTIVATE, &[]))
        .unwrap();

    host.load("acme.storm").await.unwrap();

    assert_eq!(host.status("acme.storm"), Some(PluginStatus::Deactivated));
    let events = drain(&mut events);
    assert_eq!(
        statuses(&events, "acme.storm"),
        vec!["registered", "loading", "active", "deactivated"]
    );
    assert_eq!(events.iter().filter(|e| e.name == PLUGIN_ERROR).count(), 1);
}

#[tokio::test]
async fn one_crash_does_not_affect_other_plugins() {
    let (mut host, _, _) = host();
    host.register(manifest("acme.flaky", EXITS_AFTER_READY, &[])).unwrap();
    host.register(manifest("acme.worker", WORKER, &[])).unwrap();
    host.load("acme.flaky").await.unwrap();
    host.load("acme.worker").await.unwrap();

    let _ = host.call("acme.flaky", "exit", vec![]).await;
    settle().await;
    host.process_notices().await;

    assert_eq!(host.status("acme.flaky"), Some(PluginStatus::Crashed));
    assert_eq!(host.status("acme.worker"), Some(PluginStatus::Active));
    assert_ok!(host.call("acme.worker", "echo", vec![]).await);
}

// ================================================================
// UI plugins
// ================================================================

#[tokio::test]
async fn ui_plugin_is_visible_only_while_active() {
    let (mut host, _, _) = host();
    host.register(ui_manifest("acme.panel", WORKER, &["ui.panel"]))
        .unwrap();

    host.load("acme.panel").await.unwrap();
    assert!(host.is_visible("acme.panel"));

    host.deactivate("acme.panel").await.unwrap();
    assert!(!host.is_visible("acme.panel"));

    host.activate("acme.panel").await.unwrap();
    assert!(host.is_visible("acme.panel"));

    host.unload("acme.panel").await.unwrap();
    assert!(!host.is_visible("acme.panel"));
}
