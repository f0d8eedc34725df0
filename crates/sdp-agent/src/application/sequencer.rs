//! Knock-and-connect sequencer.
//!
//! One attempt walks these states:
//!
//! ```text
//! Idle ─► BuildKnock ─► SendKnock ─► AwaitToken ─► SendSecondKnock ─► DialMtls ─► Connected
//!              │             │            │                │               │
//!              └─────────────┴────────────┴────────────────┴───────────────┴─► Failed(stage)
//! ```
//!
//! In a gateway-direct deployment the first knock goes to the gateway and the
//! sequence jumps from `SendKnock` straight to `DialMtls`.
//!
//! The sequencer never retries.  A silent controller looks exactly like a
//! wrong secret or a dropped packet, so the caller decides whether another
//! attempt is worth a fresh knock.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sdp_core::knock::open_grant;
use sdp_core::{BuiltKnock, Clock, GrantReply, KnockBuilder, ProtocolError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Default wait for the controller's grant reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Default pause between the gateway knock and the TCP connect, giving the
/// gateway time to process the datagram.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(50);

// ── Ports ─────────────────────────────────────────────────────────────────────

/// Sends knocks and collects the controller's reply.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KnockTransport: Send + Sync {
    /// Sends one datagram to `target`.
    async fn send(&self, target: SocketAddr, datagram: Vec<u8>) -> io::Result<()>;

    /// Waits up to `wait` for a datagram from `target`.
    ///
    /// Returns `Ok(None)` when nothing arrives in time.
    async fn await_reply(&self, target: SocketAddr, wait: Duration) -> io::Result<Option<Vec<u8>>>;
}

/// A byte stream to the protected service.
pub trait AgentStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AgentStream for T {}

/// An established connection through the gateway.
pub type Connection = Box<dyn AgentStream>;

/// Error returned by an [`MtlsDialer`].
#[derive(Debug, Error)]
pub enum DialError {
    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Handshake(#[source] io::Error),

    #[error("no answer within {0:?}")]
    TimedOut(Duration),
}

/// Opens the mutual-TLS connection to the gateway.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MtlsDialer: Send + Sync {
    async fn dial(&self, gateway: SocketAddr) -> Result<Connection, DialError>;
}

// ── States and errors ─────────────────────────────────────────────────────────

/// A step of the sequence that can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    BuildKnock,
    SendKnock,
    AwaitToken,
    SendSecondKnock,
    DialMtls,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BuildKnock => "build-knock",
            Self::SendKnock => "send-knock",
            Self::AwaitToken => "await-token",
            Self::SendSecondKnock => "send-second-knock",
            Self::DialMtls => "dial-mtls",
        };
        f.write_str(name)
    }
}

/// Where the sequencer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    Idle,
    At(Stage),
    Connected,
    Failed(Stage),
}

impl fmt::Display for SequenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::At(stage) => write!(f, "{stage}"),
            Self::Connected => f.write_str("connected"),
            Self::Failed(stage) => write!(f, "failed at {stage}"),
        }
    }
}

/// Why a stage failed.
#[derive(Debug, Error)]
pub enum FailureKind {
    #[error("knock could not be built: {0}")]
    Build(#[source] ProtocolError),

    #[error("knock could not be sent: {0}")]
    Transport(#[source] io::Error),

    #[error("no token received from controller")]
    NoTokenReceived,

    #[error("controller reply failed verification: {0}")]
    InvalidGrant(#[source] ProtocolError),

    #[error("controller granted a token that expired at {expires_at}")]
    ExpiredGrant { expires_at: i64 },

    #[error("could not reach gateway: {0}")]
    Connect(#[source] io::Error),

    #[error("TLS handshake rejected by gateway: {0}")]
    HandshakeRejected(#[source] io::Error),

    #[error("gateway did not answer within {0:?}")]
    TimedOut(Duration),
}

impl From<DialError> for FailureKind {
    fn from(e: DialError) -> Self {
        match e {
            DialError::Connect { source, .. } => Self::Connect(source),
            DialError::Handshake(source) => Self::HandshakeRejected(source),
            DialError::TimedOut(after) => Self::TimedOut(after),
        }
    }
}

/// The terminal failure of one attempt.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct SequencerError {
    pub stage: Stage,
    pub kind: FailureKind,
}

impl SequencerError {
    fn new(stage: Stage, kind: FailureKind) -> Self {
        Self { stage, kind }
    }
}

// ── Sequencer ─────────────────────────────────────────────────────────────────

/// Which parties the agent knocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Knock the controller for a token, then knock the gateway with it.
    ViaController { controller: SocketAddr },
    /// Knock the gateway only.
    GatewayDirect,
}

/// The gateway's two ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayEndpoints {
    pub knock: SocketAddr,
    pub tls: SocketAddr,
}

#[derive(Debug, Clone, Copy)]
pub struct SequencerSettings {
    pub reply_timeout: Duration,
    pub settle: Duration,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            settle: DEFAULT_SETTLE,
        }
    }
}

/// Runs the knock-and-connect sequence for one device.
pub struct KnockAndConnect {
    builder: KnockBuilder,
    flow: Flow,
    gateway: GatewayEndpoints,
    transport: Arc<dyn KnockTransport>,
    dialer: Arc<dyn MtlsDialer>,
    clock: Arc<dyn Clock>,
    settings: SequencerSettings,
    transitions: Vec<SequenceState>,
}

impl KnockAndConnect {
    pub fn new(
        builder: KnockBuilder,
        flow: Flow,
        gateway: GatewayEndpoints,
        transport: Arc<dyn KnockTransport>,
        dialer: Arc<dyn MtlsDialer>,
        clock: Arc<dyn Clock>,
        settings: SequencerSettings,
    ) -> Self {
        Self {
            builder,
            flow,
            gateway,
            transport,
            dialer,
            clock,
            settings,
            transitions: vec![SequenceState::Idle],
        }
    }

    /// Every state the last attempt passed through, starting with `Idle`.
    pub fn transitions(&self) -> &[SequenceState] {
        &self.transitions
    }

    /// The state the last attempt ended in.
    pub fn state(&self) -> SequenceState {
        self.transitions
            .last()
            .copied()
            .unwrap_or(SequenceState::Idle)
    }

    /// Runs one attempt.
    ///
    /// # Errors
    ///
    /// Returns [`SequencerError`] naming the stage that failed.
    pub async fn run(&mut self) -> Result<Connection, SequencerError> {
        self.transitions.clear();
        self.transitions.push(SequenceState::Idle);

        match self.attempt().await {
            Ok(connection) => {
                self.transitions.push(SequenceState::Connected);
                info!(
                    device_id = %self.builder.device_id(),
                    gateway = %self.gateway.tls,
                    "connected through gateway"
                );
                Ok(connection)
            }
            Err(e) => {
                self.transitions.push(SequenceState::Failed(e.stage));
                warn!(
                    device_id = %self.builder.device_id(),
                    stage = %e.stage,
                    "sequence failed: {e}"
                );
                Err(e)
            }
        }
    }

    async fn attempt(&mut self) -> Result<Connection, SequencerError> {
        match self.flow {
            Flow::ViaController { controller } => {
                let grant = self.fetch_grant(controller).await?;
                self.enter(Stage::SendSecondKnock);
                let knock = self
                    .build(Some(&grant.token))
                    .map_err(|e| SequencerError::new(Stage::SendSecondKnock, FailureKind::Build(e)))?;
                self.send(Stage::SendSecondKnock, self.gateway.knock, knock)
                    .await?;
            }
            Flow::GatewayDirect => {
                self.enter(Stage::BuildKnock);
                let knock = self
                    .build(None)
                    .map_err(|e| SequencerError::new(Stage::BuildKnock, FailureKind::Build(e)))?;
                self.enter(Stage::SendKnock);
                self.send(Stage::SendKnock, self.gateway.knock, knock).await?;
            }
        }

        if !self.settings.settle.is_zero() {
            tokio::time::sleep(self.settings.settle).await;
        }

        self.enter(Stage::DialMtls);
        self.dialer
            .dial(self.gateway.tls)
            .await
            .map_err(|e| SequencerError::new(Stage::DialMtls, e.into()))
    }

    async fn fetch_grant(&mut self, controller: SocketAddr) -> Result<GrantReply, SequencerError> {
        self.enter(Stage::BuildKnock);
        let knock = self
            .build(None)
            .map_err(|e| SequencerError::new(Stage::BuildKnock, FailureKind::Build(e)))?;
        let nonce = knock.nonce;

        self.enter(Stage::SendKnock);
        self.send(Stage::SendKnock, controller, knock).await?;

        self.enter(Stage::AwaitToken);
        let reply = self
            .transport
            .await_reply(controller, self.settings.reply_timeout)
            .await
            .map_err(|e| SequencerError::new(Stage::AwaitToken, FailureKind::Transport(e)))?
            .ok_or_else(|| SequencerError::new(Stage::AwaitToken, FailureKind::NoTokenReceived))?;

        let grant = open_grant(self.builder.secret(), &reply, &nonce)
            .map_err(|e| SequencerError::new(Stage::AwaitToken, FailureKind::InvalidGrant(e)))?;
        if self.clock.unix_seconds() > grant.expires_at {
            return Err(SequencerError::new(
                Stage::AwaitToken,
                FailureKind::ExpiredGrant {
                    expires_at: grant.expires_at,
                },
            ));
        }
        debug!(expires_at = grant.expires_at, "token received");
        Ok(grant)
    }

    fn build(&self, token: Option<&str>) -> Result<BuiltKnock, ProtocolError> {
        self.builder.build(self.clock.unix_seconds(), token)
    }

    async fn send(
        &self,
        stage: Stage,
        target: SocketAddr,
        knock: BuiltKnock,
    ) -> Result<(), SequencerError> {
        self.transport
            .send(target, knock.bytes)
            .await
            .map_err(|e| SequencerError::new(stage, FailureKind::Transport(e)))
    }

    fn enter(&mut self, stage: Stage) {
        debug!(%stage, "sequencer stage");
        self.transitions.push(SequenceState::At(stage));
    }
}
