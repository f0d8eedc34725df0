//! SDP host agent entry point.
//!
//! Runs the knock-and-connect sequence once and reports where it ended.
//! With `--stdio` the established connection is then spliced onto the
//! process's stdin and stdout, which makes the agent usable as an SSH
//! `ProxyCommand`:
//!
//! ```text
//! ssh -o ProxyCommand="sdp-agent --config /etc/sdp/agent.toml --stdio" host
//! ```
//!
//! | Variable           | Description                     |
//! |--------------------|---------------------------------|
//! | `SDP_AGENT_CONFIG` | Path to `agent.toml`            |
//! | `RUST_LOG`         | Overrides `agent.log_level`     |
//!
//! Logs always go to stderr so that stdout stays a clean byte stream.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sdp_agent::application::sequencer::KnockAndConnect;
use sdp_agent::infrastructure::network::knock_transport::UdpKnockTransport;
use sdp_agent::infrastructure::network::mtls_dialer::RustlsDialer;
use sdp_agent::infrastructure::storage::config::load_config;
use sdp_core::SystemClock;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// SDP host agent.
#[derive(Debug, Parser)]
#[command(
    name = "sdp-agent",
    about = "Knocks the controller and gateway, then opens a device-bound mTLS connection",
    version
)]
struct Cli {
    /// Path to the agent configuration file.
    #[arg(long, env = "SDP_AGENT_CONFIG")]
    config: PathBuf,

    /// Pipe stdin and stdout through the connection once it is established.
    #[arg(long, default_value_t = false)]
    stdio: bool,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config =
        load_config(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.agent.log_level)),
        )
        .init();

    config.validate().context("invalid agent configuration")?;
    let builder = config.knock_builder()?;
    let transport = UdpKnockTransport::bind(config.network.knock_bind)
        .await
        .with_context(|| format!("binding knock socket on {}", config.network.knock_bind))?;
    let dialer = RustlsDialer::from_config(&config).context("loading agent TLS material")?;

    info!(
        device_id = %builder.device_id(),
        flow = ?config.network.flow(),
        gateway = %config.network.gateway_tls,
        "SDP agent starting"
    );

    let mut sequencer = KnockAndConnect::new(
        builder,
        config.network.flow(),
        config.network.gateway(),
        Arc::new(transport),
        Arc::new(dialer),
        Arc::new(SystemClock),
        config.network.sequencer_settings(),
    );

    let mut connection = match sequencer.run().await {
        Ok(connection) => connection,
        Err(e) => {
            error!(state = %sequencer.state(), "{e}");
            return Err(anyhow::Error::new(e).context(format!("sequence {}", sequencer.state())));
        }
    };
    info!(state = %sequencer.state(), "sequence finished");

    if cli.stdio {
        let mut stdio = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
        let (sent, received) = tokio::io::copy_bidirectional(&mut connection, &mut stdio)
            .await
            .context("relaying stdio through the gateway")?;
        info!(sent, received, "connection closed");
    } else {
        println!("{}", sequencer.state());
    }
    Ok(())
}
