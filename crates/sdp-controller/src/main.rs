//! SDP controller entry point.
//!
//! The controller is the first hop of the admission sequence.  A device
//! proves it knows its knock secret with a single UDP packet; the controller
//! answers with a short-lived signed token that the device then presents to
//! the gateway.
//!
//! # Usage
//!
//! ```text
//! sdp-controller [OPTIONS]
//!
//! Options:
//!   --config <PATH>   Path to controller.toml [env: SDP_CONTROLLER_CONFIG]
//!   --write-default   Write a default config to --config and exit
//! ```
//!
//! # Startup sequence
//!
//! 1. Parse CLI arguments and load the TOML config.
//! 2. Initialise `tracing` (`RUST_LOG` wins over `controller.log_level`).
//! 3. Start the knock port, the token API and the sweep task.
//! 4. Wait for Ctrl+C, then signal every task through a `watch` channel.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sdp_controller::infrastructure::runtime;
use sdp_controller::infrastructure::storage::config::{
    default_config_path, load_config, save_config, ControllerConfig,
};
use sdp_core::SystemClock;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// SDP controller.
///
/// Authenticates device knocks and issues short-lived access tokens.
#[derive(Debug, Parser)]
#[command(
    name = "sdp-controller",
    about = "Authenticates device knocks and issues short-lived access tokens",
    version
)]
struct Cli {
    /// Path to the controller configuration file.
    ///
    /// Defaults to `controller.toml` in the platform config directory.
    #[arg(long, env = "SDP_CONTROLLER_CONFIG")]
    config: Option<PathBuf>,

    /// Write a default configuration to the config path and exit.
    #[arg(long, default_value_t = false)]
    write_default: bool,
}

impl Cli {
    fn config_path(&self) -> anyhow::Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => default_config_path().context("no --config given"),
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let path = cli.config_path()?;

    if cli.write_default {
        save_config(&ControllerConfig::default(), &path)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("wrote default configuration to {}", path.display());
        return Ok(());
    }

    let config = load_config(&path).with_context(|| format!("loading {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.controller.log_level)),
        )
        .init();

    info!(
        config = %path.display(),
        devices = config.devices.len(),
        "SDP controller starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller = runtime::start(&config, Arc::new(SystemClock), shutdown_rx)
        .await
        .context("starting controller")?;

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, shutting down"),
        Err(e) => tracing::error!("failed to listen for Ctrl+C signal: {e}"),
    }
    let _ = shutdown_tx.send(true);

    let stats = controller.spa_stats.snapshot();
    let issued = controller.grants.issued_count();
    controller.join().await;

    info!(
        received = stats.received,
        dropped = stats.dropped(),
        issued,
        "SDP controller stopped"
    );
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
