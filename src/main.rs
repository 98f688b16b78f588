#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

use conduit::config;
use conduit::manager::Manager;
use conduit::watcher::ConfigWatcher;

/// Forward local TCP ports to remote endpoints over a shared SSH bastion
/// session.
#[derive(Parser)]
#[command(name = "conduit", version)]
struct Cli {
    /// Path to the config file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let cli = Cli::parse();
    info!("starting with config {}", cli.config.display());

    let cfg = config::load(&cli.config).context("failed to load config")?;
    info!(
        "loaded {} tunnel(s) via {}@{}:{}",
        cfg.tunnels.len(),
        cfg.ssh.user,
        cfg.ssh.host,
        cfg.ssh.port
    );

    let manager = Manager::new(cfg.ssh.clone());

    for tunnel_cfg in &cfg.tunnels {
        let name = tunnel_cfg.name.clone();
        if let Err(e) = manager.add(tunnel_cfg.clone()).await {
            warn!(tunnel = %name, "failed to add tunnel: {}", e);
            continue;
        }
        info!(
            tunnel = %name,
            "added tunnel ({}:{} -> 127.0.0.1:{})",
            tunnel_cfg.remote_host,
            tunnel_cfg.remote_port,
            tunnel_cfg.local_port
        );
    }

    let failures = manager.start_all().await;
    for (name, e) in &failures {
        error!(tunnel = %name, "failed to start tunnel: {}", e);
    }
    for (name, status) in manager.status().await {
        info!(tunnel = %name, "tunnel status: {}", status);
    }

    let watcher = ConfigWatcher::new(&cli.config, Arc::clone(&manager))
        .context("failed to create watcher")?;
    watcher.start().await.context("failed to start watcher")?;
    info!("watching config file for changes");

    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }

    watcher.stop().await;
    if let Err(e) = manager.close().await {
        warn!("shutdown finished with errors: {}", e);
    }

    info!("stopped");
    Ok(())
}
