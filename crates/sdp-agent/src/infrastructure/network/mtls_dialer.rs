//! rustls client for the gateway's TLS port.
//!
//! The agent always presents its device certificate.  The gateway is
//! authenticated one of two ways:
//!
//! - **CA roots** – standard WebPKI validation of the gateway certificate
//!   against `server_name`.
//! - **Pinned fingerprint** – the SHA-256 of the gateway's DER certificate
//!   must equal a configured value.  Suits self-signed gateway certificates.
//!
//! # TLS 1.3 and Gate 2
//!
//! Under TLS 1.3 the client finishes its side of the handshake before the
//! gateway has judged the client certificate.  A rejected certificate then
//! surfaces as an alert on the first read rather than as a handshake error.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sdp_core::domain::device::fingerprint_of;
use sdp_core::tls::{self as core_tls, TlsConfigError};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::application::sequencer::{Connection, DialError, MtlsDialer};
use crate::infrastructure::storage::config::{AgentConfig, ConfigError};

/// Error building a [`RustlsDialer`].
#[derive(Debug, Error)]
pub enum DialerSetupError {
    #[error(transparent)]
    Tls(#[from] TlsConfigError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid TLS server name {0:?}")]
    ServerName(String),
}

/// How the agent authenticates the gateway.
#[derive(Debug, Clone)]
pub enum ServerTrust {
    Roots(RootCertStore),
    Pinned([u8; 32]),
}

// ── Pinned server verification ────────────────────────────────────────────────

/// Accepts exactly one server certificate, identified by its SHA-256.
#[derive(Debug)]
pub struct PinnedServerVerifier {
    fingerprint: [u8; 32],
    provider: Arc<CryptoProvider>,
}

impl PinnedServerVerifier {
    pub fn new(fingerprint: [u8; 32], provider: Arc<CryptoProvider>) -> Self {
        Self {
            fingerprint,
            provider,
        }
    }
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let presented = fingerprint_of(end_entity.as_ref());
        if presented.ct_eq(&self.fingerprint).into() {
            Ok(ServerCertVerified::assertion())
        } else {
            debug!(
                presented = %hex::encode(presented),
                "gateway certificate does not match pinned fingerprint"
            );
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Builds the client config: device certificate plus server trust.
///
/// # Errors
///
/// Returns [`TlsConfigError`] when the key does not match the certificate
/// or the provider rejects the configuration.
pub fn client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    trust: ServerTrust,
) -> Result<ClientConfig, TlsConfigError> {
    let provider = core_tls::provider();
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;
    let builder = match trust {
        ServerTrust::Roots(roots) => builder.with_root_certificates(roots),
        ServerTrust::Pinned(fingerprint) => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedServerVerifier::new(
                fingerprint,
                provider,
            ))),
    };
    Ok(builder.with_client_auth_cert(certs, key)?)
}

// ── Dialer ────────────────────────────────────────────────────────────────────

/// An [`MtlsDialer`] backed by tokio-rustls.
pub struct RustlsDialer {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl RustlsDialer {
    /// # Errors
    ///
    /// Returns [`DialerSetupError::ServerName`] when `server_name` is neither
    /// a DNS name nor an IP address.
    pub fn new(
        config: ClientConfig,
        server_name: &str,
        connect_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Result<Self, DialerSetupError> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| DialerSetupError::ServerName(server_name.to_string()))?;
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
            connect_timeout,
            handshake_timeout,
        })
    }

    /// Loads the certificate, key and server trust named in `config`.
    pub fn from_config(config: &AgentConfig) -> Result<Self, DialerSetupError> {
        let certs = core_tls::load_certs(&config.tls.cert_path)?;
        let key = core_tls::load_private_key(&config.tls.key_path)?;
        let trust = match (&config.tls.server_ca_path, config.tls.server_fingerprint()?) {
            (Some(path), None) => ServerTrust::Roots(core_tls::load_root_store(path)?),
            (None, Some(fingerprint)) => ServerTrust::Pinned(fingerprint),
            _ => {
                return Err(ConfigError::Invalid(
                    "set exactly one of tls.server_ca_path and tls.server_fingerprint".to_string(),
                )
                .into())
            }
        };
        Self::new(
            client_config(certs, key, trust)?,
            &config.tls.server_name,
            config.network.connect_timeout(),
            config.tls.handshake_timeout(),
        )
    }
}

#[async_trait]
impl MtlsDialer for RustlsDialer {
    async fn dial(&self, gateway: SocketAddr) -> Result<Connection, DialError> {
        let tcp = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(gateway)).await
        {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(source)) => {
                return Err(DialError::Connect {
                    addr: gateway,
                    source,
                })
            }
            Err(_) => return Err(DialError::TimedOut(self.connect_timeout)),
        };
        if let Err(e) = tcp.set_nodelay(true) {
            debug!("failed to set TCP_NODELAY: {e}");
        }

        let handshake = self.connector.connect(self.server_name.clone(), tcp);
        match tokio::time::timeout(self.handshake_timeout, handshake).await {
            Ok(Ok(tls)) => {
                debug!(%gateway, "TLS handshake complete");
                let connection: Connection = Box::new(tls);
                Ok(connection)
            }
            Ok(Err(e)) => Err(DialError::Handshake(e)),
            Err(_) => Err(DialError::TimedOut(self.handshake_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use rcgen::{CertificateParams, DnType, KeyPair};

    use super::*;

    fn self_signed(cn: &str) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![cn.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        let cert = params.self_signed(&key).unwrap();
        (
            cert.der().clone(),
            PrivateKeyDer::Pkcs8(key.serialize_der().into()),
        )
    }

    fn verify(verifier: &PinnedServerVerifier, cert: &CertificateDer<'_>) -> bool {
        verifier
            .verify_server_cert(
                cert,
                &[],
                &ServerName::try_from("localhost").unwrap(),
                &[],
                UnixTime::now(),
            )
            .is_ok()
    }

    #[test]
    fn test_pinned_verifier_accepts_matching_certificate() {
        // Arrange
        let (cert, _) = self_signed("localhost");
        let verifier = PinnedServerVerifier::new(fingerprint_of(&cert), core_tls::provider());

        // Act / Assert
        assert!(verify(&verifier, &cert));
    }

    #[test]
    fn test_pinned_verifier_rejects_other_certificate() {
        // Arrange
        let (pinned, _) = self_signed("localhost");
        let (other, _) = self_signed("localhost");
        let verifier = PinnedServerVerifier::new(fingerprint_of(&pinned), core_tls::provider());

        // Act / Assert
        assert!(!verify(&verifier, &other));
    }

    #[test]
    fn test_client_config_builds_for_both_trust_modes() {
        // Arrange
        let (device, key) = self_signed("dev-1");
        let (server, _) = self_signed("localhost");
        let roots = core_tls::roots_from([server.clone()]).unwrap();

        // Act
        let with_roots = client_config(vec![device.clone()], key.clone_key(), ServerTrust::Roots(roots));
        let pinned = client_config(
            vec![device],
            key,
            ServerTrust::Pinned(fingerprint_of(&server)),
        );

        // Assert
        assert!(with_roots.is_ok());
        assert!(pinned.is_ok());
    }

    #[test]
    fn test_dialer_rejects_invalid_server_name() {
        // Arrange
        let (device, key) = self_signed("dev-1");
        let config = client_config(vec![device], key, ServerTrust::Pinned([0u8; 32])).unwrap();

        // Act
        let result = RustlsDialer::new(
            config,
            "not a hostname!",
            Duration::from_secs(1),
            Duration::from_secs(1),
        );

        // Assert
        assert!(matches!(result, Err(DialerSetupError::ServerName(_))));
    }

    #[tokio::test]
    async fn test_dial_to_closed_port_is_a_connect_error() {
        // Arrange
        let (device, key) = self_signed("dev-1");
        let config = client_config(vec![device], key, ServerTrust::Pinned([0u8; 32])).unwrap();
        let dialer =
            RustlsDialer::new(config, "localhost", Duration::from_secs(2), Duration::from_secs(2))
                .unwrap();
        let closed = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        // Act
        let result = dialer.dial(closed).await;

        // Assert
        assert!(matches!(result, Err(DialError::Connect { .. })));
    }
}
