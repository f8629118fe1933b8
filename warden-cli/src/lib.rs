//! Pieces of the `warden` binary that are worth testing on their own:
//! manifest loading from disk, the terminal consent prompt and the
//! supervision loop.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::future::Future;
use std::io::{BufRead, Write};
use std::path::Path;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use warden_host::{
    ConsentProvider, ConsentRequest, HostEvent, Notice, PluginManager, PluginManifest,
};

/// Reads and validates a manifest, resolving relative `main` and `ui`
/// entries against the manifest's directory.
pub fn load_manifest(path: &Path) -> Result<PluginManifest> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    let manifest = PluginManifest::from_json(&text)
        .with_context(|| format!("failed to parse manifest {}", path.display()))?;
    manifest
        .validate()
        .with_context(|| format!("invalid manifest {}", path.display()))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    Ok(resolve_entries(manifest, base))
}

pub fn resolve_entries(mut manifest: PluginManifest, base: &Path) -> PluginManifest {
    manifest.main = resolve(base, &manifest.main);
    manifest.ui = manifest.ui.map(|ui| resolve(base, &ui));
    manifest
}

fn resolve(base: &Path, entry: &str) -> String {
    let path = Path::new(entry);
    if path.is_absolute() {
        entry.to_string()
    } else {
        base.join(path).to_string_lossy().into_owned()
    }
}

/// Asks on the controlling terminal before granting sensitive capabilities.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalConsent;

#[async_trait]
impl ConsentProvider for TerminalConsent {
    async fn request_consent(&self, request: ConsentRequest) -> bool {
        let prompt = consent_prompt(&request);
        let answered = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
            let mut stderr = std::io::stderr().lock();
            write!(stderr, "{prompt}")?;
            stderr.flush()?;
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            Ok(line)
        })
        .await;

        match answered {
            Ok(Ok(line)) => is_affirmative(&line),
            Ok(Err(e)) => {
                warn!(plugin_id = %request.plugin_id, "consent prompt failed: {}", e);
                false
            }
            Err(e) => {
                warn!(plugin_id = %request.plugin_id, "consent prompt aborted: {}", e);
                false
            }
        }
    }
}

pub fn consent_prompt(request: &ConsentRequest) -> String {
    format!(
        "Plugin '{}' ({}) requests: {}. Allow? [y/N] ",
        request.plugin_name,
        request.plugin_id,
        request.capabilities.join(", ")
    )
}

/// Only an explicit yes grants.
pub fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Applies notices and logs host events until `shutdown` completes or the
/// manager's channels close.
///
/// Only the cancel-safe waits are raced; a notice is applied after the
/// race so a busy event stream cannot drop it halfway.
pub async fn supervise<F>(
    manager: &mut PluginManager,
    mut events: broadcast::Receiver<HostEvent>,
    shutdown: F,
) where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        let notice = tokio::select! {
            () = &mut shutdown => {
                info!("Shutting down");
                break;
            }
            notice = manager.next_notice() => match notice {
                Some(notice) => notice,
                None => break,
            },
            event = events.recv() => {
                match event {
                    Ok(event) => log_event(&event),
                    Err(RecvError::Lagged(skipped)) => debug!(skipped, "event log lagged"),
                    Err(RecvError::Closed) => break,
                }
                continue;
            }
        };

        match &notice {
            Notice::Terminated { plugin_id, reason, .. } => {
                warn!(plugin_id = %plugin_id, "Plugin terminated: {}", reason);
            }
            Notice::FailureStorm { plugin_id, errors } => {
                warn!(plugin_id = %plugin_id, errors, "Plugin deactivated after repeated failures");
            }
        }
        manager.apply_notice(notice).await;
    }
}

fn log_event(event: &HostEvent) {
    let plugin_id = event.plugin_id.as_deref().unwrap_or("-");
    info!(plugin_id = %plugin_id, event = %event.name, data = %event.data, "Host event");
}
