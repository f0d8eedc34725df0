//! Wires the gateway together from a loaded configuration.
//!
//! The knock port and the TLS port share one [`AdmissionGate`]: the first
//! writes entries, the second consumes them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sdp_core::listener::{ListenerError, ListenerStats};
use sdp_core::tls::TlsConfigError;
use sdp_core::{
    Clock, DeviceRegistry, InMemoryRegistry, KnockValidator, RegistryError, ReplayGuard,
    TokenError, TokenIssuer,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::application::admission_gate::AdmissionGate;
use crate::application::admit_knock::{AdmitKnockUseCase, TokenPolicy};
use crate::infrastructure::network::gateway_listener::{
    GatewayListener, GatewayListenerConfig, GatewayListenerError, GatewayStats,
};
use crate::infrastructure::network::spa_listener;
use crate::infrastructure::proxy::ConnectionHandler;
use crate::infrastructure::storage::config::{ConfigError, GatewayConfig};
use crate::infrastructure::tls::ServerTls;

/// Error returned when the gateway cannot start.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("device registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("token verifier: {0}")]
    Token(#[from] TokenError),

    #[error("TLS: {0}")]
    Tls(#[from] TlsConfigError),

    #[error(transparent)]
    Knock(#[from] ListenerError),

    #[error(transparent)]
    Gateway(#[from] GatewayListenerError),
}

/// Handles to a started gateway.
pub struct RunningGateway {
    pub knock_addr: SocketAddr,
    pub tls_addr: SocketAddr,
    pub spa_stats: Arc<ListenerStats>,
    pub gateway_stats: Arc<GatewayStats>,
    pub admissions: Arc<AdmitKnockUseCase>,
    pub validator: Arc<KnockValidator>,
    /// Shared by both ports.  Removing a device here also stops its admitted
    /// connections at Gate 2.
    pub registry: Arc<InMemoryRegistry>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningGateway {
    /// Waits for every gateway task to finish after shutdown.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("gateway task ended abnormally: {e}");
            }
        }
    }
}

/// Starts the gateway, serving authenticated connections with `handler`.
///
/// # Errors
///
/// Returns [`StartError`] if the configuration is invalid or a socket cannot
/// be bound.
pub async fn start(
    config: &GatewayConfig,
    tls: ServerTls,
    handler: Arc<dyn ConnectionHandler>,
    clock: Arc<dyn Clock>,
    shutdown: watch::Receiver<bool>,
) -> Result<RunningGateway, StartError> {
    config.validate()?;
    let security = &config.security;

    let registry = Arc::new(InMemoryRegistry::from_entries(&config.devices)?);
    let replay = ReplayGuard::in_memory(
        Arc::clone(&clock),
        security.max_clock_skew(),
        security.replay_capacity,
    );
    let validator = Arc::new(KnockValidator::new(
        Arc::clone(&registry) as Arc<dyn DeviceRegistry>,
        replay,
        Arc::clone(&clock),
        security.max_clock_skew(),
    ));

    let tokens = if security.require_token {
        let verifier = TokenIssuer::new(
            security.token_secret()?,
            security.issuer.clone(),
            sdp_core::token::DEFAULT_TOKEN_TTL,
            Arc::clone(&clock),
        )?;
        Some(TokenPolicy::in_memory(
            verifier,
            Arc::clone(&clock),
            security.used_token_capacity,
        ))
    } else {
        None
    };

    let gate = AdmissionGate::in_memory(
        Arc::clone(&clock),
        config.admission.ttl(),
        config.admission.capacity,
    );
    let admissions = Arc::new(AdmitKnockUseCase::new(
        gate.clone(),
        config.gateway.service.clone(),
        tokens,
    ));

    let spa = spa_listener::start(
        config.network.knock_listen,
        Arc::clone(&validator),
        Arc::clone(&admissions),
        config.network.max_inflight,
        shutdown.clone(),
    )
    .await?;

    let listener = GatewayListener::bind(
        config.network.tls_listen,
        gate,
        Arc::clone(&registry) as Arc<dyn DeviceRegistry>,
        Arc::new(tls),
        handler,
        GatewayListenerConfig {
            handshake_timeout: config.tls.handshake_timeout(),
            max_connections: config.network.max_connections,
        },
    )
    .await?;
    let tls_addr = listener.local_addr()?;
    let gateway_stats = listener.stats();
    let tls_task = listener.spawn(shutdown.clone());

    let sweep_task = tokio::spawn(sweep_loop(
        Arc::clone(&validator),
        Arc::clone(&admissions),
        security.sweep_interval(),
        shutdown,
    ));

    info!(
        service = %config.gateway.service,
        knock = %spa.local_addr,
        tls = %tls_addr,
        upstream = %config.network.upstream,
        require_token = security.require_token,
        "gateway started"
    );
    Ok(RunningGateway {
        knock_addr: spa.local_addr,
        tls_addr,
        spa_stats: spa.stats,
        gateway_stats,
        admissions,
        validator,
        registry,
        tasks: vec![spa.task, tls_task, sweep_task],
    })
}

async fn sweep_loop(
    validator: Arc<KnockValidator>,
    admissions: Arc<AdmitKnockUseCase>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    while !*shutdown.borrow() {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let replays = validator.replay_guard().sweep();
                let entries = admissions.gate().sweep();
                let tokens = admissions.token_policy().map_or(0, TokenPolicy::sweep);
                if replays + entries + tokens > 0 {
                    debug!(replays, entries, tokens, "swept expired records");
                }
            }
        }
    }
}
