//! The controller's knock port.

use std::net::SocketAddr;
use std::sync::Arc;

use sdp_core::listener::{ListenerError, ListenerStats};
use sdp_core::{KnockValidator, SpaListener, SpaListenerConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::application::issue_grant::IssueGrantUseCase;

/// A running controller knock port.
pub struct ControllerSpa {
    pub local_addr: SocketAddr,
    pub stats: Arc<ListenerStats>,
    pub task: JoinHandle<()>,
}

/// Binds `addr` and starts answering knocks with grants from `use_case`.
///
/// # Errors
///
/// Returns [`ListenerError`] if the socket cannot be bound.
pub async fn start(
    addr: SocketAddr,
    validator: Arc<KnockValidator>,
    use_case: Arc<IssueGrantUseCase>,
    max_inflight: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<ControllerSpa, ListenerError> {
    let config = SpaListenerConfig {
        name: "controller",
        max_inflight,
    };
    let listener = SpaListener::bind(addr, validator, use_case, config).await?;
    let local_addr = listener.local_addr()?;
    let stats = listener.stats();
    let task = listener.spawn(shutdown);
    Ok(ControllerSpa {
        local_addr,
        stats,
        task,
    })
}
