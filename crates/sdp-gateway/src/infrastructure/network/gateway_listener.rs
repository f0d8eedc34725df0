//! The TLS port in front of the protected service.
//!
//! # Two gates
//!
//! ```text
//! TCP accept ──► Gate 1: admission entry for peer IP?   no ──► drop socket
//!                    │ yes (entry consumed)
//!                    ▼
//!                Gate 2: device still enrolled?          no ──► drop socket
//!                        mTLS handshake, client cert
//!                        bound to that device?           no ──► abort handshake
//!                    │ yes
//!                    ▼
//!                ConnectionHandler (upstream proxy)
//! ```
//!
//! Gate 1 runs before a single byte is read from or written to the socket,
//! so a scanner without a fresh knock sees a connection that opens and
//! closes with nothing in between.  The handshake is the only step that
//! waits on the peer and it is bounded by `handshake_timeout`.
//!
//! Gate 2 looks the device up in the registry again rather than trusting the
//! copy stored with the admission entry, so a device removed after its knock
//! cannot complete a handshake.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sdp_core::DeviceRegistry;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::application::admission_gate::{Admission, AdmissionGate};
use crate::infrastructure::proxy::ConnectionHandler;
use crate::infrastructure::tls::ServerTls;

/// Default bound on the TLS handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default cap on concurrent connections past Gate 1.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Error type for listener setup.
#[derive(Debug, Error)]
pub enum GatewayListenerError {
    #[error("failed to bind TLS listener on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read local address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

/// Listener tuning.
#[derive(Debug, Clone)]
pub struct GatewayListenerConfig {
    pub handshake_timeout: Duration,
    pub max_connections: usize,
}

impl Default for GatewayListenerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

// ── Statistics ────────────────────────────────────────────────────────────────

/// Per-gate counters.
#[derive(Debug, Default)]
pub struct GatewayStats {
    accepted: AtomicU64,
    gate1_refused: AtomicU64,
    saturated: AtomicU64,
    gate2_rejected: AtomicU64,
    handshake_timeouts: AtomicU64,
    established: AtomicU64,
}

/// A point-in-time copy of [`GatewayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStatsSnapshot {
    /// TCP connections accepted by the kernel.
    pub accepted: u64,
    /// Connections dropped for lack of an admission entry.
    pub gate1_refused: u64,
    /// Connections dropped because the connection cap was reached.
    pub saturated: u64,
    /// Connections refused at Gate 2: device no longer enrolled, or the
    /// handshake aborted, including certificate mismatches.
    pub gate2_rejected: u64,
    pub handshake_timeouts: u64,
    /// Connections handed to the handler.
    pub established: u64,
}

impl GatewayStats {
    pub fn snapshot(&self) -> GatewayStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        GatewayStatsSnapshot {
            accepted: load(&self.accepted),
            gate1_refused: load(&self.gate1_refused),
            saturated: load(&self.saturated),
            gate2_rejected: load(&self.gate2_rejected),
            handshake_timeouts: load(&self.handshake_timeouts),
            established: load(&self.established),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ── Listener ──────────────────────────────────────────────────────────────────

/// A bound gateway TLS port.
pub struct GatewayListener {
    listener: TcpListener,
    gate: AdmissionGate,
    registry: Arc<dyn DeviceRegistry>,
    tls: Arc<ServerTls>,
    handler: Arc<dyn ConnectionHandler>,
    permits: Arc<Semaphore>,
    stats: Arc<GatewayStats>,
    config: GatewayListenerConfig,
}

impl GatewayListener {
    /// Binds the TCP socket.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayListenerError::BindFailed`] if the socket cannot be
    /// bound.
    pub async fn bind(
        addr: SocketAddr,
        gate: AdmissionGate,
        registry: Arc<dyn DeviceRegistry>,
        tls: Arc<ServerTls>,
        handler: Arc<dyn ConnectionHandler>,
        config: GatewayListenerConfig,
    ) -> Result<Self, GatewayListenerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayListenerError::BindFailed { addr, source })?;
        Ok(Self {
            listener,
            gate,
            registry,
            tls,
            handler,
            permits: Arc::new(Semaphore::new(config.max_connections.max(1))),
            stats: Arc::new(GatewayStats::default()),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, GatewayListenerError> {
        self.listener
            .local_addr()
            .map_err(GatewayListenerError::LocalAddr)
    }

    pub fn stats(&self) -> Arc<GatewayStats> {
        Arc::clone(&self.stats)
    }

    /// Runs the accept loop on a new task.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Runs the accept loop until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        match self.listener.local_addr() {
            Ok(addr) => info!("gateway TLS listener on TCP {addr}"),
            Err(e) => warn!("gateway TLS listener address unknown: {e}"),
        }

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.dispatch(stream, peer),
                        Err(e) => error!("gateway accept error: {e}"),
                    }
                }
            }
        }
        info!("gateway TLS listener stopped");
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        GatewayStats::bump(&self.stats.accepted);

        // Gate 1
        let Some(admission) = self.gate.take(peer.ip()) else {
            GatewayStats::bump(&self.stats.gate1_refused);
            debug!(%peer, "no admission entry, connection dropped");
            drop(stream);
            return;
        };

        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            GatewayStats::bump(&self.stats.saturated);
            warn!(%peer, "gateway saturated, admitted connection dropped");
            return;
        };

        let registry = Arc::clone(&self.registry);
        let tls = Arc::clone(&self.tls);
        let handler = Arc::clone(&self.handler);
        let stats = Arc::clone(&self.stats);
        let handshake_timeout = self.config.handshake_timeout;
        tokio::spawn(async move {
            let _permit = permit;
            serve_connection(
                stream,
                peer,
                admission,
                registry.as_ref(),
                &tls,
                handler.as_ref(),
                &stats,
                handshake_timeout,
            )
            .await;
        });
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    mut admission: Admission,
    registry: &dyn DeviceRegistry,
    tls: &ServerTls,
    handler: &dyn ConnectionHandler,
    stats: &GatewayStats,
    handshake_timeout: Duration,
) {
    let device_id = admission.device.device_id.clone();

    // Gate 2
    let Some(device) = registry.lookup(&device_id) else {
        GatewayStats::bump(&stats.gate2_rejected);
        warn!(%peer, %device_id, "device no longer enrolled, connection dropped");
        drop(stream);
        return;
    };
    admission.device = device;

    let config = match tls.config_for(&admission.device) {
        Ok(config) => config,
        Err(e) => {
            GatewayStats::bump(&stats.gate2_rejected);
            error!(%peer, %device_id, "cannot build TLS config: {e}");
            return;
        }
    };

    let acceptor = TlsAcceptor::from(config);
    let tls_stream = match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls_stream)) => tls_stream,
        Ok(Err(e)) => {
            GatewayStats::bump(&stats.gate2_rejected);
            warn!(%peer, %device_id, "TLS handshake rejected: {e}");
            return;
        }
        Err(_) => {
            GatewayStats::bump(&stats.handshake_timeouts);
            debug!(%peer, %device_id, "TLS handshake timed out");
            return;
        }
    };

    GatewayStats::bump(&stats.established);
    info!(%peer, %device_id, "device connected");
    if let Err(e) = handler.handle(tls_stream, admission, peer).await {
        debug!(%peer, %device_id, "connection ended with error: {e}");
    }
}
