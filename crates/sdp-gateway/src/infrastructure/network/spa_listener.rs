//! The gateway's knock port.

use std::net::SocketAddr;
use std::sync::Arc;

use sdp_core::listener::{ListenerError, ListenerStats};
use sdp_core::{KnockValidator, SpaListener, SpaListenerConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::application::admit_knock::AdmitKnockUseCase;

/// A running gateway knock port.
pub struct GatewaySpa {
    pub local_addr: SocketAddr,
    pub stats: Arc<ListenerStats>,
    pub task: JoinHandle<()>,
}

/// Binds `addr` and admits the sources of valid knocks through `use_case`.
///
/// The handler never produces a reply, so this port is silent for every
/// datagram, valid or not.
///
/// # Errors
///
/// Returns [`ListenerError`] if the socket cannot be bound.
pub async fn start(
    addr: SocketAddr,
    validator: Arc<KnockValidator>,
    use_case: Arc<AdmitKnockUseCase>,
    max_inflight: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<GatewaySpa, ListenerError> {
    let config = SpaListenerConfig {
        name: "gateway",
        max_inflight,
    };
    let listener = SpaListener::bind(addr, validator, use_case, config).await?;
    let local_addr = listener.local_addr()?;
    let stats = listener.stats();
    let task = listener.spawn(shutdown);
    Ok(GatewaySpa {
        local_addr,
        stats,
        task,
    })
}
