//! What happens to a connection once both gates have passed.
//!
//! The default [`UpstreamProxy`] opens a plain TCP connection to the
//! protected service and copies bytes both ways until either side closes.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tracing::{debug, info};

use crate::application::admission_gate::Admission;

/// Serves one authenticated connection.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        stream: TlsStream<TcpStream>,
        admission: Admission,
        peer: SocketAddr,
    ) -> io::Result<()>;
}

/// Pipes the TLS stream to the protected upstream service.
#[derive(Debug, Clone)]
pub struct UpstreamProxy {
    upstream: SocketAddr,
    connect_timeout: Duration,
}

impl UpstreamProxy {
    pub fn new(upstream: SocketAddr, connect_timeout: Duration) -> Self {
        Self {
            upstream,
            connect_timeout,
        }
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }
}

#[async_trait]
impl ConnectionHandler for UpstreamProxy {
    async fn handle(
        &self,
        mut stream: TlsStream<TcpStream>,
        admission: Admission,
        peer: SocketAddr,
    ) -> io::Result<()> {
        let connect = TcpStream::connect(self.upstream);
        let mut upstream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("upstream {} did not accept in time", self.upstream),
                )
            })??;
        debug!(%peer, upstream = %self.upstream, "upstream connected");

        let (from_client, from_upstream) =
            tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
        info!(
            %peer,
            device_id = %admission.device.device_id,
            from_client,
            from_upstream,
            "session closed"
        );
        Ok(())
    }
}
