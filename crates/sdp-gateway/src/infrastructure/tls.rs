//! Gate 2: per-connection TLS configuration bound to the admitted device.
//!
//! Every TCP connection that passes Gate 1 carries the [`Device`] whose
//! knock admitted it.  [`ServerTls::config_for`] builds a rustls
//! `ServerConfig` whose client-certificate verifier accepts exactly that
//! device's certificate:
//!
//! - `CertFingerprint` bindings pin the SHA-256 of the DER certificate.
//!   No CA is involved; self-signed device certificates are fine.
//! - `SubjectCommonName` bindings first verify the chain against the
//!   configured client CA bundle (rustls' WebPKI verifier), then require the
//!   subject CN to equal the binding.
//!
//! A certificate that does not match aborts the handshake, so no application
//! byte from an unbound device ever reaches the upstream service.

use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{
    CertificateError, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig,
    SignatureScheme,
};
use sdp_core::tls::{self as core_tls, TlsConfigError};
use sdp_core::{Device, DeviceId, IdentityBinding};
use tracing::debug;

// ── Server certificate ────────────────────────────────────────────────────────

/// Always presents the gateway's one certificate.
#[derive(Debug)]
struct SingleCertResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for SingleCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

// ── Client certificate verification ───────────────────────────────────────────

/// Accepts only the certificate bound to one device.
#[derive(Debug)]
pub struct DeviceBoundClientVerifier {
    device_id: DeviceId,
    binding: IdentityBinding,
    /// Chain verifier, present for common-name bindings.
    chain: Option<Arc<dyn ClientCertVerifier>>,
    provider: Arc<CryptoProvider>,
}

impl DeviceBoundClientVerifier {
    /// # Errors
    ///
    /// Returns [`TlsConfigError::Verifier`] when `device` is bound by common
    /// name and no client CA is configured.
    pub fn new(
        device: &Device,
        chain: Option<Arc<dyn ClientCertVerifier>>,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self, TlsConfigError> {
        let chain = if device.identity.requires_ca() {
            Some(chain.ok_or_else(|| {
                TlsConfigError::Verifier(format!(
                    "device {} is bound by common name but no client CA is configured",
                    device.device_id
                ))
            })?)
        } else {
            None
        };
        Ok(Self {
            device_id: device.device_id.clone(),
            binding: device.identity.clone(),
            chain,
            provider,
        })
    }
}

impl ClientCertVerifier for DeviceBoundClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        match &self.chain {
            Some(chain) => chain.root_hint_subjects(),
            None => &[],
        }
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        if let Some(chain) = &self.chain {
            chain.verify_client_cert(end_entity, intermediates, now)?;
        }

        let presented = core_tls::presented_identity(end_entity.as_ref());
        if self.binding.matches(&presented) {
            Ok(ClientCertVerified::assertion())
        } else {
            debug!(
                device_id = %self.device_id,
                presented = %hex::encode(presented.fingerprint),
                "client certificate does not match device binding"
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

// ── Config factory ────────────────────────────────────────────────────────────

/// The gateway's TLS identity plus the optional client CA.
#[derive(Debug)]
pub struct ServerTls {
    certified: Arc<CertifiedKey>,
    chain: Option<Arc<dyn ClientCertVerifier>>,
    provider: Arc<CryptoProvider>,
}

impl ServerTls {
    /// # Errors
    ///
    /// Returns [`TlsConfigError`] if the key is unusable or the client CA
    /// bundle cannot back a verifier.
    pub fn new(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        client_roots: Option<RootCertStore>,
    ) -> Result<Self, TlsConfigError> {
        let provider = core_tls::provider();
        let signing_key = provider.key_provider.load_private_key(key)?;
        let certified = Arc::new(CertifiedKey::new(certs, signing_key));
        let chain = match client_roots {
            Some(roots) => Some(
                WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
                    .build()
                    .map_err(|e| TlsConfigError::Verifier(e.to_string()))?,
            ),
            None => None,
        };
        Ok(Self {
            certified,
            chain,
            provider,
        })
    }

    /// Loads the server certificate chain, key and optional client CA bundle
    /// from PEM files.
    pub fn from_files(
        cert_path: &Path,
        key_path: &Path,
        client_ca_path: Option<&Path>,
    ) -> Result<Self, TlsConfigError> {
        let certs = core_tls::load_certs(cert_path)?;
        let key = core_tls::load_private_key(key_path)?;
        let roots = client_ca_path.map(core_tls::load_root_store).transpose()?;
        Self::new(certs, key, roots)
    }

    pub fn has_client_ca(&self) -> bool {
        self.chain.is_some()
    }

    /// Builds the server config for a connection admitted on behalf of
    /// `device`.
    pub fn config_for(&self, device: &Device) -> Result<Arc<ServerConfig>, TlsConfigError> {
        let verifier = DeviceBoundClientVerifier::new(
            device,
            self.chain.clone(),
            Arc::clone(&self.provider),
        )?;
        let config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(Arc::new(verifier))
            .with_cert_resolver(Arc::new(SingleCertResolver(Arc::clone(&self.certified))));
        Ok(Arc::new(config))
    }
}
