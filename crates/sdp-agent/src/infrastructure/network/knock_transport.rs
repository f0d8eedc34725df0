//! UDP knock transport.
//!
//! Knocks to the controller and to the gateway leave from the same socket.
//! The controller answers the address the knock came from, so the grant
//! reply arrives on this socket too.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use sdp_core::protocol::MAX_GRANT_LEN;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::application::sequencer::KnockTransport;

/// A [`KnockTransport`] over a single tokio UDP socket.
#[derive(Debug)]
pub struct UdpKnockTransport {
    socket: UdpSocket,
}

impl UdpKnockTransport {
    /// Binds the local socket.  Port 0 picks an ephemeral port.
    pub async fn bind(local: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl KnockTransport for UdpKnockTransport {
    async fn send(&self, target: SocketAddr, datagram: Vec<u8>) -> io::Result<()> {
        let sent = self.socket.send_to(&datagram, target).await?;
        if sent != datagram.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("knock truncated to {sent} of {} bytes", datagram.len()),
            ));
        }
        debug!(%target, len = sent, "knock sent");
        Ok(())
    }

    async fn await_reply(&self, target: SocketAddr, wait: Duration) -> io::Result<Option<Vec<u8>>> {
        let deadline = tokio::time::Instant::now() + wait;
        // One spare byte so an oversized reply is seen as oversized.
        let mut buf = vec![0u8; MAX_GRANT_LEN + 1];
        loop {
            match tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                Err(_) => return Ok(None),
                Ok(Ok((len, from))) if from == target => return Ok(Some(buf[..len].to_vec())),
                Ok(Ok((_, from))) => debug!(%from, "ignoring datagram from unexpected peer"),
                // ICMP port-unreachable surfaces here on some platforms.
                Ok(Err(e))
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    debug!(%target, "knock target unreachable: {e}");
                }
                Ok(Err(e)) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn peer() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    #[tokio::test]
    async fn test_send_delivers_the_whole_datagram() {
        // Arrange
        let transport = UdpKnockTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let (target, target_addr) = peer().await;

        // Act
        transport.send(target_addr, vec![7u8; 300]).await.unwrap();

        // Assert
        let mut buf = [0u8; 512];
        let (len, from) = target.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 300);
        assert_eq!(from, transport.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_await_reply_returns_datagram_from_target() {
        // Arrange
        let transport = UdpKnockTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let (target, target_addr) = peer().await;
        target
            .send_to(b"grant", transport.local_addr().unwrap())
            .await
            .unwrap();

        // Act
        let reply = transport
            .await_reply(target_addr, Duration::from_secs(2))
            .await
            .unwrap();

        // Assert
        assert_eq!(reply.as_deref(), Some(&b"grant"[..]));
    }

    #[tokio::test]
    async fn test_await_reply_ignores_other_senders() {
        // Arrange
        let transport = UdpKnockTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let (_target, target_addr) = peer().await;
        let (stranger, _) = peer().await;
        stranger
            .send_to(b"spoof", transport.local_addr().unwrap())
            .await
            .unwrap();

        // Act
        let reply = transport
            .await_reply(target_addr, Duration::from_millis(200))
            .await
            .unwrap();

        // Assert
        assert_eq!(reply, None);
    }

    #[tokio::test]
    async fn test_await_reply_times_out_with_none() {
        // Arrange
        let transport = UdpKnockTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let (_target, target_addr) = peer().await;

        // Act
        let reply = transport
            .await_reply(target_addr, Duration::from_millis(50))
            .await
            .unwrap();

        // Assert
        assert!(reply.is_none());
    }
}
