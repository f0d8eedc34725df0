//! Registered devices and the identity each one must prove.
//!
//! A device proves itself twice.  Its knock is authenticated with a
//! [`KnockSecret`] shared with the control plane, and its TLS client
//! certificate must satisfy its [`IdentityBinding`].  Both facts are keyed by
//! the same [`DeviceId`], which is what ties the anonymous UDP channel to the
//! authenticated TCP channel.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

/// Maximum length of a device identifier in bytes.
pub const MAX_DEVICE_ID_LEN: usize = 64;

/// Minimum knock secret length in bytes.
pub const MIN_KNOCK_SECRET_LEN: usize = 16;

/// Errors raised while constructing domain values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// The device identifier is empty.
    #[error("device id must not be empty")]
    EmptyId,

    /// The device identifier exceeds [`MAX_DEVICE_ID_LEN`] bytes.
    #[error("device id is {len} bytes, maximum is {MAX_DEVICE_ID_LEN}")]
    IdTooLong { len: usize },

    /// The knock secret is shorter than [`MIN_KNOCK_SECRET_LEN`] bytes.
    #[error("knock secret is {len} bytes, minimum is {MIN_KNOCK_SECRET_LEN}")]
    SecretTooShort { len: usize },

    /// A hex field could not be decoded.
    #[error("invalid hex in {field}: {reason}")]
    InvalidHex { field: &'static str, reason: String },

    /// A certificate fingerprint is not 32 bytes long.
    #[error("certificate fingerprint must be 32 bytes, got {0}")]
    BadFingerprintLength(usize),
}

// ── DeviceId ──────────────────────────────────────────────────────────────────

/// A validated device identifier: non-empty UTF-8, at most 64 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Validates and wraps `value`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::EmptyId`] or [`DeviceError::IdTooLong`].
    pub fn new(value: impl Into<String>) -> Result<Self, DeviceError> {
        let value = value.into();
        if value.is_empty() {
            return Err(DeviceError::EmptyId);
        }
        if value.len() > MAX_DEVICE_ID_LEN {
            return Err(DeviceError::IdTooLong { len: value.len() });
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl TryFrom<String> for DeviceId {
    type Error = DeviceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── KnockSecret ───────────────────────────────────────────────────────────────

/// The per-device HMAC key used to authenticate knocks and grant replies.
///
/// The bytes are wiped from memory when the secret is dropped, and `Debug`
/// never prints them.
#[derive(Clone, PartialEq, Eq)]
pub struct KnockSecret(Zeroizing<Vec<u8>>);

impl KnockSecret {
    /// Wraps raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::SecretTooShort`] for keys under 16 bytes.
    pub fn new(bytes: Vec<u8>) -> Result<Self, DeviceError> {
        if bytes.len() < MIN_KNOCK_SECRET_LEN {
            return Err(DeviceError::SecretTooShort { len: bytes.len() });
        }
        Ok(Self(Zeroizing::new(bytes)))
    }

    /// Decodes a hex-encoded key, as stored in configuration files.
    pub fn from_hex(hex_str: &str) -> Result<Self, DeviceError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|e| DeviceError::InvalidHex {
            field: "knock_secret",
            reason: e.to_string(),
        })?;
        Self::new(bytes)
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for KnockSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KnockSecret([redacted; {} bytes])", self.0.len())
    }
}

// ── Identity binding ──────────────────────────────────────────────────────────

/// What a device's TLS client certificate must look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityBinding {
    /// SHA-256 of the DER-encoded end-entity certificate.
    CertFingerprint([u8; 32]),
    /// Subject common name of a certificate issued by a trusted CA.
    SubjectCommonName(String),
}

impl IdentityBinding {
    /// Builds a fingerprint binding from a hex string (colons are ignored).
    pub fn fingerprint_from_hex(hex_str: &str) -> Result<Self, DeviceError> {
        let cleaned: String = hex_str.chars().filter(|c| *c != ':').collect();
        let bytes = hex::decode(cleaned.trim()).map_err(|e| DeviceError::InvalidHex {
            field: "cert_fingerprint",
            reason: e.to_string(),
        })?;
        let array: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| DeviceError::BadFingerprintLength(bytes.len()))?;
        Ok(Self::CertFingerprint(array))
    }

    /// Builds a fingerprint binding for a DER certificate.
    pub fn for_certificate(cert_der: &[u8]) -> Self {
        Self::CertFingerprint(fingerprint_of(cert_der))
    }

    /// Returns `true` when `presented` satisfies this binding.
    ///
    /// Fingerprints are compared in constant time.  A common-name binding
    /// only checks the name; the caller is responsible for having verified
    /// the CA chain first.
    pub fn matches(&self, presented: &PresentedIdentity) -> bool {
        match self {
            IdentityBinding::CertFingerprint(expected) => {
                expected.ct_eq(&presented.fingerprint).into()
            }
            IdentityBinding::SubjectCommonName(expected) => {
                presented.common_name.as_deref() == Some(expected.as_str())
            }
        }
    }

    /// Returns `true` for bindings that rely on a CA chain.
    pub fn requires_ca(&self) -> bool {
        matches!(self, IdentityBinding::SubjectCommonName(_))
    }
}

/// The identity facts extracted from a certificate presented during a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentedIdentity {
    pub fingerprint: [u8; 32],
    pub common_name: Option<String>,
}

/// SHA-256 over a DER-encoded certificate.
pub fn fingerprint_of(cert_der: &[u8]) -> [u8; 32] {
    Sha256::digest(cert_der).into()
}

// ── Device ────────────────────────────────────────────────────────────────────

/// A registered device.
#[derive(Debug, Clone)]
pub struct Device {
    pub device_id: DeviceId,
    pub knock_secret: KnockSecret,
    pub identity: IdentityBinding,
    /// Service tags this device may reach.  Empty means "no access".
    pub allowed_services: Vec<String>,
}

impl Device {
    pub fn new(
        device_id: DeviceId,
        knock_secret: KnockSecret,
        identity: IdentityBinding,
        allowed_services: Vec<String>,
    ) -> Self {
        Self {
            device_id,
            knock_secret,
            identity,
            allowed_services,
        }
    }

    /// Returns `true` if `service` is in this device's allowed services.
    pub fn permits(&self, service: &str) -> bool {
        self.allowed_services.iter().any(|s| s == service)
    }
}
