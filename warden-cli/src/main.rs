//! Warden plugin host.
//!
//! Loads plugin manifests from disk and runs each plugin in its own child
//! process sandbox until interrupted.
//!
//! Usage:
//!   warden --manifest plugins/clock/manifest.json --manifest plugins/notes/manifest.json
//!
//! Host settings come from `~/.warden/host.toml` unless `--config` is given.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use warden_cli::{TerminalConsent, load_manifest, supervise};
use warden_host::{
    ConsentProvider, HostConfig, MemoryStorage, PluginManager, ProcessBackend, StaticConsent,
};

#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(about = "Runs sandboxed plugins with capability-based permissions")]
struct Args {
    /// Plugin manifest to register and load (repeatable)
    #[arg(short, long = "manifest", required = true)]
    manifests: Vec<PathBuf>,

    /// Host config file (defaults to ~/.warden/host.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Grant every consent request without prompting
    #[arg(short, long)]
    yes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let config = match &args.config {
        Some(path) => HostConfig::read(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => HostConfig::load(),
    };

    let consent: Arc<dyn ConsentProvider> = if args.yes {
        Arc::new(StaticConsent::AllowAll)
    } else {
        Arc::new(TerminalConsent)
    };
    let backend = Arc::new(ProcessBackend::new(config.sandbox.clone()));
    let mut manager = PluginManager::new(config, backend, consent);
    manager.register_provider(Arc::new(MemoryStorage::new()));
    let events = manager.subscribe();

    let mut plugin_ids = Vec::new();
    for path in &args.manifests {
        let manifest = load_manifest(path)?;
        let plugin_id = manifest.id.clone();
        manager
            .register(manifest)
            .with_context(|| format!("failed to register {}", path.display()))?;
        plugin_ids.push(plugin_id);
    }

    for plugin_id in &plugin_ids {
        if manager.is_loaded(plugin_id) {
            continue;
        }
        if let Err(e) = manager.load(plugin_id).await {
            error!(plugin_id = %plugin_id, "Failed to load plugin: {}", e);
        }
    }

    println!("\n========================================");
    println!("  Warden Plugin Host Running");
    println!("========================================");
    for descriptor in manager.list() {
        println!(
            "  {:<24} {:<8} {}",
            descriptor.id(),
            descriptor.version(),
            descriptor.status()
        );
    }
    println!("========================================\n");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
        }
    };
    supervise(&mut manager, events, shutdown).await;

    manager.shutdown().await;
    Ok(())
}

