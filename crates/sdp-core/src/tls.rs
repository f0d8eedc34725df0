//! TLS material shared by the gateway and the host agent.
//!
//! Provides PEM loading for certificates, private keys and CA bundles, the
//! `ring` crypto provider both sides build their configs with, and the
//! extraction of a [`PresentedIdentity`] from a DER certificate.  The
//! verifiers that enforce device bindings live next to the code that uses
//! them, in the gateway and the agent.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use thiserror::Error;
use x509_parser::prelude::*;

use crate::domain::device::{fingerprint_of, PresentedIdentity};

/// Errors raised while loading TLS material or building a TLS config.
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("client verifier error: {0}")]
    Verifier(String),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// The crypto provider every TLS config in the workspace is built with.
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Reads every certificate from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsConfigError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Reads the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsConfigError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsConfigError::NoPrivateKey(path.to_path_buf()))
}

/// Builds a root store from a PEM CA bundle.
pub fn load_root_store(path: &Path) -> Result<RootCertStore, TlsConfigError> {
    roots_from(load_certs(path)?)
}

/// Builds a root store from DER certificates.
pub fn roots_from(
    certs: impl IntoIterator<Item = CertificateDer<'static>>,
) -> Result<RootCertStore, TlsConfigError> {
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| TlsConfigError::InvalidCertificate(e.to_string()))?;
    }
    Ok(roots)
}

/// Extracts the fingerprint and subject common name of a DER certificate.
///
/// The fingerprint is always available.  The common name is `None` when the
/// certificate cannot be parsed or has no CN attribute; a parse failure
/// therefore only ever weakens what the certificate can prove.
pub fn presented_identity(cert_der: &[u8]) -> PresentedIdentity {
    let common_name = X509Certificate::from_der(cert_der)
        .ok()
        .and_then(|(_, cert)| {
            cert.subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .map(str::to_string)
        });
    PresentedIdentity {
        fingerprint: fingerprint_of(cert_der),
        common_name,
    }
}

/// Hex SHA-256 of a DER certificate, in the form configuration files use.
pub fn fingerprint_hex(cert_der: &[u8]) -> String {
    hex::encode(fingerprint_of(cert_der))
}

fn open(path: &Path) -> Result<BufReader<File>, TlsConfigError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
}
