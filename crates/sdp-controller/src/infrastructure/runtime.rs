//! Wires the controller together from a loaded configuration.
//!
//! [`start`] builds the registry, replay guard, validator and token issuer,
//! binds both listeners and spawns the periodic sweep.  The binary and the
//! integration tests share this path so that what is tested is what runs.

use std::net::SocketAddr;
use std::sync::Arc;

use sdp_core::listener::{ListenerError, ListenerStats};
use sdp_core::replay::DEFAULT_REPLAY_CAPACITY;
use sdp_core::{
    Clock, InMemoryRegistry, KnockValidator, RegistryError, ReplayGuard, TokenError, TokenIssuer,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::application::issue_grant::IssueGrantUseCase;
use crate::infrastructure::http;
use crate::infrastructure::network::spa_listener;
use crate::infrastructure::storage::config::{ConfigError, ControllerConfig};

/// Error returned when the controller cannot start.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("device registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("token issuer: {0}")]
    Token(#[from] TokenError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("failed to bind token API on {addr}: {source}")]
    HttpBind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Handles to a started controller.
pub struct RunningController {
    pub knock_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub spa_stats: Arc<ListenerStats>,
    pub grants: Arc<IssueGrantUseCase>,
    pub validator: Arc<KnockValidator>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningController {
    /// Waits for every controller task to finish after shutdown.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("controller task ended abnormally: {e}");
            }
        }
    }
}

/// Starts the controller.
///
/// # Errors
///
/// Returns [`StartError`] if the configuration is invalid or a socket cannot
/// be bound.
pub async fn start(
    config: &ControllerConfig,
    clock: Arc<dyn Clock>,
    shutdown: watch::Receiver<bool>,
) -> Result<RunningController, StartError> {
    config.validate()?;
    let security = &config.security;

    let registry = Arc::new(InMemoryRegistry::from_entries(&config.devices)?);
    let capacity = if security.replay_capacity == 0 {
        DEFAULT_REPLAY_CAPACITY
    } else {
        security.replay_capacity
    };
    let replay = ReplayGuard::in_memory(Arc::clone(&clock), security.max_clock_skew(), capacity);
    let validator = Arc::new(KnockValidator::new(
        registry,
        replay,
        Arc::clone(&clock),
        security.max_clock_skew(),
    ));
    let issuer = Arc::new(TokenIssuer::new(
        security.token_secret()?,
        config.controller.issuer.clone(),
        security.token_ttl(),
        clock,
    )?);
    let grants = Arc::new(IssueGrantUseCase::new(Arc::clone(&issuer)));

    let spa = spa_listener::start(
        config.network.knock_listen,
        Arc::clone(&validator),
        Arc::clone(&grants),
        config.network.max_inflight,
        shutdown.clone(),
    )
    .await?;

    let addr = config.network.http_listen;
    let http_listener = TcpListener::bind(addr)
        .await
        .map_err(|source| StartError::HttpBind { addr, source })?;
    let http_addr = http_listener
        .local_addr()
        .map_err(|source| StartError::HttpBind { addr, source })?;
    let http_shutdown = shutdown.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http::serve(http_listener, issuer, http_shutdown).await {
            error!("token API stopped: {e}");
        }
    });

    let sweep_task = tokio::spawn(sweep_loop(
        Arc::clone(&validator),
        security.sweep_interval(),
        shutdown,
    ));

    info!(
        knock = %spa.local_addr,
        http = %http_addr,
        "controller started"
    );
    Ok(RunningController {
        knock_addr: spa.local_addr,
        http_addr,
        spa_stats: spa.stats,
        grants,
        validator,
        tasks: vec![spa.task, http_task, sweep_task],
    })
}

async fn sweep_loop(
    validator: Arc<KnockValidator>,
    every: std::time::Duration,
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
                let removed = validator.replay_guard().sweep();
                if removed > 0 {
                    debug!(removed, "swept expired replay records");
                }
            }
        }
    }
}
