//! Integration tests for the controller: real sockets on loopback.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sdp_controller::infrastructure::runtime::{self, RunningController};
use sdp_controller::infrastructure::storage::config::ControllerConfig;
use sdp_core::knock::open_grant;
use sdp_core::{Clock, DeviceEntry, DeviceId, KnockBuilder, KnockSecret, ManualClock, TokenIssuer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio_test::assert_ok;

const TOKEN_SECRET_HEX: &str = "4242424242424242424242424242424242424242424242424242424242424242";
const DEV1_SECRET_HEX: &str = "000102030405060708090a0b0c0d0e0f";

fn config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.network.knock_listen = "127.0.0.1:0".parse().unwrap();
    config.network.http_listen = "127.0.0.1:0".parse().unwrap();
    config.security.token_secret_hex = TOKEN_SECRET_HEX.to_string();
    config.devices = vec![
        DeviceEntry {
            device_id: "dev-1".to_string(),
            knock_secret_hex: DEV1_SECRET_HEX.to_string(),
            cert_fingerprint: Some("ab".repeat(32)),
            common_name: None,
            services: vec!["ssh".to_string()],
        },
        DeviceEntry {
            device_id: "idle".to_string(),
            knock_secret_hex: "ff".repeat(16),
            cert_fingerprint: Some("cd".repeat(32)),
            common_name: None,
            services: vec![],
        },
    ];
    config
}

fn dev1() -> KnockBuilder {
    KnockBuilder::new(
        DeviceId::new("dev-1").unwrap(),
        KnockSecret::from_hex(DEV1_SECRET_HEX).unwrap(),
    )
}

async fn start(clock: Arc<ManualClock>) -> (RunningController, watch::Sender<bool>) {
    let (tx, rx) = watch::channel(false);
    let controller = runtime::start(&config(), clock, rx).await.unwrap();
    (controller, tx)
}

async fn knock(addr: SocketAddr, bytes: &[u8], wait: Duration) -> Option<Vec<u8>> {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(bytes, addr).await.unwrap();
    let mut buf = vec![0u8; 2048];
    match tokio::time::timeout(wait, socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => Some(buf[..len].to_vec()),
        _ => None,
    }
}

#[tokio::test]
async fn test_valid_knock_is_answered_with_a_verifiable_grant() {
    // Arrange
    let clock = Arc::new(ManualClock::new());
    let (controller, _tx) = start(Arc::clone(&clock)).await;
    let built = dev1().build(clock.unix_seconds(), None).unwrap();

    // Act
    let reply = knock(controller.knock_addr, &built.bytes, Duration::from_secs(2))
        .await
        .expect("grant reply expected");

    // Assert
    let grant = assert_ok!(open_grant(dev1().secret(), &reply, &built.nonce));
    let verifier = TokenIssuer::new(
        hex::decode(TOKEN_SECRET_HEX).unwrap(),
        "sdp-controller",
        Duration::from_secs(120),
        clock.clone(),
    )
    .unwrap();
    let claims = assert_ok!(verifier.verify(&grant.token));
    assert_eq!(claims.sub, "dev-1");
    assert_eq!(claims.exp - claims.iat, 120);
    assert_eq!(grant.expires_at, claims.exp);
    assert_eq!(controller.grants.issued_count(), 1);
}

#[tokio::test]
async fn test_replayed_knock_gets_no_second_grant() {
    // Arrange
    let clock = Arc::new(ManualClock::new());
    let (controller, _tx) = start(Arc::clone(&clock)).await;
    let built = dev1().build(clock.unix_seconds(), None).unwrap();
    knock(controller.knock_addr, &built.bytes, Duration::from_secs(2))
        .await
        .expect("first knock is answered");

    // Act
    let second = knock(controller.knock_addr, &built.bytes, Duration::from_millis(300)).await;

    // Assert
    assert!(second.is_none());
    assert_eq!(controller.spa_stats.snapshot().replayed, 1);
    assert_eq!(controller.grants.issued_count(), 1);
}

#[tokio::test]
async fn test_stale_knock_is_silently_dropped() {
    // Arrange
    let clock = Arc::new(ManualClock::new());
    let (controller, _tx) = start(Arc::clone(&clock)).await;
    let built = dev1().build(clock.unix_seconds() - 31, None).unwrap();

    // Act
    let reply = knock(controller.knock_addr, &built.bytes, Duration::from_millis(300)).await;

    // Assert
    assert!(reply.is_none());
    assert_eq!(controller.spa_stats.snapshot().stale, 1);
    assert!(controller.validator.replay_guard().is_empty());
}

#[tokio::test]
async fn test_unknown_device_and_garbage_get_no_reply() {
    // Arrange
    let clock = Arc::new(ManualClock::new());
    let (controller, _tx) = start(Arc::clone(&clock)).await;
    let stranger = KnockBuilder::new(
        DeviceId::new("stranger").unwrap(),
        KnockSecret::from_hex(DEV1_SECRET_HEX).unwrap(),
    )
    .build(clock.unix_seconds(), None)
    .unwrap();

    // Act
    let unknown = knock(controller.knock_addr, &stranger.bytes, Duration::from_millis(300)).await;
    let garbage = knock(controller.knock_addr, b"GET / HTTP/1.1\r\n\r\n", Duration::from_millis(300)).await;

    // Assert
    assert!(unknown.is_none());
    assert!(garbage.is_none());
    let stats = controller.spa_stats.snapshot();
    assert_eq!(stats.unknown_device, 1);
    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.replies, 0);
}

#[tokio::test]
async fn test_device_without_services_gets_no_reply() {
    // Arrange
    let clock = Arc::new(ManualClock::new());
    let (controller, _tx) = start(Arc::clone(&clock)).await;
    let idle = KnockBuilder::new(
        DeviceId::new("idle").unwrap(),
        KnockSecret::from_hex(&"ff".repeat(16)).unwrap(),
    )
    .build(clock.unix_seconds(), None)
    .unwrap();

    // Act
    let reply = knock(controller.knock_addr, &idle.bytes, Duration::from_millis(300)).await;

    // Assert
    assert!(reply.is_none());
    assert_eq!(controller.spa_stats.snapshot().accepted, 1);
    assert_eq!(controller.grants.refused_count(), 1);
}

#[tokio::test]
async fn test_health_endpoint_is_served_over_tcp() {
    // Arrange
    let clock = Arc::new(ManualClock::new());
    let (controller, _tx) = start(clock).await;
    let mut stream = TcpStream::connect(controller.http_addr).await.unwrap();

    // Act
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    // Assert
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(r#"{"status":"pass"}"#));
}

#[tokio::test]
async fn test_shutdown_stops_every_task() {
    // Arrange
    let clock = Arc::new(ManualClock::new());
    let (controller, tx) = start(clock).await;

    // Act
    tx.send(true).unwrap();
    let joined = tokio::time::timeout(Duration::from_secs(5), controller.join()).await;

    // Assert
    assert!(joined.is_ok(), "controller tasks did not stop");
}
