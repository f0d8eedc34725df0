//! UDP receive loop shared by both SPA ports.
//!
//! The listener binds a UDP socket and hands every datagram to the shared
//! [`KnockValidator`].  Valid knocks go to a [`KnockHandler`], which may
//! return a reply; the reply is sent back to the datagram's source address
//! and nowhere else.  Invalid knocks are dropped without a single byte going
//! back, so the port is indistinguishable from a closed one.
//!
//! # Concurrency
//!
//! Each datagram is processed in its own short-lived task.  A semaphore caps
//! the number of tasks in flight; when it is exhausted the datagram is
//! dropped immediately instead of queueing, so a flood cannot build an
//! unbounded backlog.
//!
//! # Shutdown
//!
//! [`SpaListener::run`] watches a `tokio::sync::watch` channel.  Sending
//! `true` (or dropping the sender) ends the loop after the current datagram.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::knock::{KnockRejection, KnockValidator, ValidatedKnock};
use crate::protocol::messages::MAX_KNOCK_LEN;

/// Default cap on concurrently processed datagrams.
pub const DEFAULT_MAX_INFLIGHT: usize = 256;

/// Error type for listener setup.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The UDP socket could not be bound.
    #[error("failed to bind SPA socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The bound address could not be read back.
    #[error("failed to read local address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

/// Receives validated knocks.
///
/// Returning `Some(bytes)` sends `bytes` to the knock's source address.
/// Returning `None` keeps the port silent.
pub trait KnockHandler: Send + Sync + 'static {
    fn on_knock(&self, knock: ValidatedKnock, source: SocketAddr) -> Option<Vec<u8>>;
}

/// Listener tuning.
#[derive(Debug, Clone)]
pub struct SpaListenerConfig {
    /// Label used in log lines, e.g. `"controller"`.
    pub name: &'static str,
    pub max_inflight: usize,
}

impl Default for SpaListenerConfig {
    fn default() -> Self {
        Self {
            name: "spa",
            max_inflight: DEFAULT_MAX_INFLIGHT,
        }
    }
}

// ── Statistics ────────────────────────────────────────────────────────────────

/// Counters updated by the listener.  Never exposed to peers.
#[derive(Debug, Default)]
pub struct ListenerStats {
    received: AtomicU64,
    oversized: AtomicU64,
    saturated: AtomicU64,
    malformed: AtomicU64,
    unknown_device: AtomicU64,
    bad_tag: AtomicU64,
    stale: AtomicU64,
    replayed: AtomicU64,
    guard_full: AtomicU64,
    accepted: AtomicU64,
    replies: AtomicU64,
}

/// A point-in-time copy of [`ListenerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStatsSnapshot {
    pub received: u64,
    pub oversized: u64,
    pub saturated: u64,
    pub malformed: u64,
    pub unknown_device: u64,
    pub bad_tag: u64,
    pub stale: u64,
    pub replayed: u64,
    pub guard_full: u64,
    pub accepted: u64,
    pub replies: u64,
}

impl ListenerStatsSnapshot {
    /// Datagrams that were dropped for any reason.
    pub fn dropped(&self) -> u64 {
        self.oversized
            + self.saturated
            + self.malformed
            + self.unknown_device
            + self.bad_tag
            + self.stale
            + self.replayed
            + self.guard_full
    }
}

impl ListenerStats {
    pub fn snapshot(&self) -> ListenerStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ListenerStatsSnapshot {
            received: load(&self.received),
            oversized: load(&self.oversized),
            saturated: load(&self.saturated),
            malformed: load(&self.malformed),
            unknown_device: load(&self.unknown_device),
            bad_tag: load(&self.bad_tag),
            stale: load(&self.stale),
            replayed: load(&self.replayed),
            guard_full: load(&self.guard_full),
            accepted: load(&self.accepted),
            replies: load(&self.replies),
        }
    }

    fn record_rejection(&self, rejection: &KnockRejection) {
        let counter = match rejection {
            KnockRejection::Malformed(_) => &self.malformed,
            KnockRejection::UnknownDevice(_) => &self.unknown_device,
            KnockRejection::BadTag(_) => &self.bad_tag,
            KnockRejection::Stale { .. } => &self.stale,
            KnockRejection::Replayed(_) => &self.replayed,
            KnockRejection::GuardFull(_) => &self.guard_full,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ── Listener ──────────────────────────────────────────────────────────────────

/// A bound SPA port.
pub struct SpaListener {
    socket: Arc<UdpSocket>,
    validator: Arc<KnockValidator>,
    handler: Arc<dyn KnockHandler>,
    permits: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
    config: SpaListenerConfig,
}

impl SpaListener {
    /// Binds the UDP socket.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::BindFailed`] if the socket cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        validator: Arc<KnockValidator>,
        handler: Arc<dyn KnockHandler>,
        config: SpaListenerConfig,
    ) -> Result<Self, ListenerError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ListenerError::BindFailed { addr, source })?;
        Ok(Self {
            socket: Arc::new(socket),
            validator,
            handler,
            permits: Arc::new(Semaphore::new(config.max_inflight.max(1))),
            stats: Arc::new(ListenerStats::default()),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ListenerError> {
        self.socket.local_addr().map_err(ListenerError::LocalAddr)
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Runs the receive loop on a new task.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Runs the receive loop until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let name = self.config.name;
        match self.socket.local_addr() {
            Ok(addr) => info!("{name} SPA listener on UDP {addr}"),
            Err(e) => warn!("{name} SPA listener address unknown: {e}"),
        }

        // One extra byte so an oversized datagram is detectable after truncation.
        let mut buf = vec![0u8; MAX_KNOCK_LEN + 1];
        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, source) = match received {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!("{name} SPA recv error: {e}");
                            continue;
                        }
                    };
                    self.dispatch(&buf[..len], source);
                }
            }
        }
        info!("{name} SPA listener stopped");
    }

    fn dispatch(&self, datagram: &[u8], source: SocketAddr) {
        ListenerStats::bump(&self.stats.received);
        if datagram.len() > MAX_KNOCK_LEN {
            ListenerStats::bump(&self.stats.oversized);
            debug!(%source, "oversized datagram dropped");
            return;
        }
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            ListenerStats::bump(&self.stats.saturated);
            debug!(%source, "listener saturated, datagram dropped");
            return;
        };

        let datagram = datagram.to_vec();
        let socket = Arc::clone(&self.socket);
        let validator = Arc::clone(&self.validator);
        let handler = Arc::clone(&self.handler);
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            let _permit = permit;
            process_datagram(&datagram, source, &socket, &validator, handler.as_ref(), &stats)
                .await;
        });
    }
}

async fn process_datagram(
    datagram: &[u8],
    source: SocketAddr,
    socket: &UdpSocket,
    validator: &KnockValidator,
    handler: &dyn KnockHandler,
    stats: &ListenerStats,
) {
    let knock = match validator.validate(datagram) {
        Ok(knock) => knock,
        Err(rejection) => {
            stats.record_rejection(&rejection);
            if matches!(
                rejection,
                KnockRejection::Replayed(_) | KnockRejection::GuardFull(_)
            ) {
                warn!(%source, "knock dropped: {rejection}");
            } else {
                debug!(%source, reason = rejection.as_str(), "knock dropped: {rejection}");
            }
            return;
        }
    };
    ListenerStats::bump(&stats.accepted);

    if let Some(reply) = handler.on_knock(knock, source) {
        match socket.send_to(&reply, source).await {
            Ok(_) => ListenerStats::bump(&stats.replies),
            Err(e) => warn!(%source, "failed to send reply: {e}"),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
