//! SDP gateway entry point.
//!
//! Keeps one TCP service dark.  The TLS port accepts a connection only from
//! an address that knocked within the last few seconds, and only completes
//! the handshake for the certificate bound to the device that knocked.
//!
//! # Usage
//!
//! ```text
//! sdp-gateway --config <PATH>
//! ```
//!
//! | Variable             | Description                       |
//! |----------------------|-----------------------------------|
//! | `SDP_GATEWAY_CONFIG` | Path to `gateway.toml`            |
//! | `RUST_LOG`           | Overrides `gateway.log_level`     |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sdp_core::SystemClock;
use sdp_gateway::infrastructure::proxy::UpstreamProxy;
use sdp_gateway::infrastructure::runtime;
use sdp_gateway::infrastructure::storage::config::load_config;
use sdp_gateway::infrastructure::tls::ServerTls;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// SDP gateway.
#[derive(Debug, Parser)]
#[command(
    name = "sdp-gateway",
    about = "Hides a TCP service behind a knock port and a device-bound mTLS listener",
    version
)]
struct Cli {
    /// Path to the gateway configuration file.
    #[arg(long, env = "SDP_GATEWAY_CONFIG")]
    config: PathBuf,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config =
        load_config(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.gateway.log_level)),
        )
        .init();

    let tls = ServerTls::from_files(
        &config.tls.cert_path,
        &config.tls.key_path,
        config.tls.client_ca_path.as_deref(),
    )
    .context("loading gateway TLS material")?;
    let proxy = UpstreamProxy::new(
        config.network.upstream,
        config.network.upstream_connect_timeout(),
    );

    info!(
        config = %cli.config.display(),
        devices = config.devices.len(),
        "SDP gateway starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gateway = runtime::start(
        &config,
        tls,
        Arc::new(proxy),
        Arc::new(SystemClock),
        shutdown_rx,
    )
    .await
    .context("starting gateway")?;

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, shutting down"),
        Err(e) => tracing::error!("failed to listen for Ctrl+C signal: {e}"),
    }
    let _ = shutdown_tx.send(true);

    let knocks = gateway.spa_stats.snapshot();
    let connections = gateway.gateway_stats.snapshot();
    gateway.join().await;

    info!(
        knocks_received = knocks.received,
        knocks_admitted = knocks.accepted,
        gate1_refused = connections.gate1_refused,
        gate2_rejected = connections.gate2_rejected,
        established = connections.established,
        "SDP gateway stopped"
    );
    Ok(())
}
