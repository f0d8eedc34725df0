//! Admit the source of a validated knock.
//!
//! The gateway runs the same knock validation as the controller; by the time
//! a knock reaches this use case its tag, freshness and nonce have been
//! checked.  What remains is the gateway's own policy:
//!
//! 1. The device must be allowed to reach this gateway's service.
//! 2. When tokens are required, the knock must carry a controller token that
//!    verifies, names the knocking device as `sub`, lists the service in its
//!    `scope` and has not been presented before (`jti` is single use).
//!
//! Only then is the source IP admitted.  The knock port never answers,
//! whatever the outcome.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sdp_core::{
    Clock, ExpiringStore, InsertOutcome, KnockHandler, ShardedExpiringStore, TokenError,
    TokenIssuer, ValidatedKnock,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::admission_gate::AdmissionGate;

/// Default maximum number of remembered token ids.
pub const DEFAULT_USED_TOKEN_CAPACITY: usize = 100_000;

/// Why a validated knock did not lead to an admission.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmitError {
    #[error("device {device_id} may not reach service {service:?}")]
    ServiceNotPermitted { device_id: String, service: String },

    #[error("knock carries no token")]
    MissingToken,

    #[error("token rejected: {0}")]
    Token(#[from] TokenError),

    #[error("token subject {subject:?} does not match knocking device {device_id}")]
    SubjectMismatch { subject: String, device_id: String },

    #[error("token scope does not include service {0:?}")]
    OutOfScope(String),

    #[error("token {0} was already used")]
    TokenReused(Uuid),

    #[error("used-token list is full, token {0} cannot be recorded")]
    UsedTokensFull(Uuid),
}

/// Token checks applied when the gateway requires a controller token.
pub struct TokenPolicy {
    verifier: TokenIssuer,
    used: Arc<dyn ExpiringStore<Uuid, ()>>,
    clock: Arc<dyn Clock>,
}

impl TokenPolicy {
    pub fn new(
        verifier: TokenIssuer,
        used: Arc<dyn ExpiringStore<Uuid, ()>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            verifier,
            used,
            clock,
        }
    }

    /// A policy remembering at most `capacity` used token ids in memory.
    /// Once full, tokens are refused until old ids expire.
    pub fn in_memory(verifier: TokenIssuer, clock: Arc<dyn Clock>, capacity: usize) -> Self {
        let used: ShardedExpiringStore<Uuid, ()> =
            ShardedExpiringStore::new(Arc::clone(&clock), capacity);
        Self::new(verifier, Arc::new(used), clock)
    }

    /// Drops used-token records whose token has expired anyway.
    pub fn sweep(&self) -> usize {
        self.used.sweep()
    }

    fn check(&self, token: &str, device_id: &str, service: &str) -> Result<(), AdmitError> {
        let now = self.clock.unix_seconds();
        let claims = self.verifier.verify_at(token, now)?;
        if claims.sub != device_id {
            return Err(AdmitError::SubjectMismatch {
                subject: claims.sub,
                device_id: device_id.to_string(),
            });
        }
        if !claims.allows(service) {
            return Err(AdmitError::OutOfScope(service.to_string()));
        }

        // Remember the id until the token could no longer verify anyway.
        let remaining = (claims.exp - now).max(0) as u64 + 1;
        match self
            .used
            .insert_if_absent(claims.jti, (), Duration::from_secs(remaining))
        {
            InsertOutcome::Stored => Ok(()),
            InsertOutcome::Present => Err(AdmitError::TokenReused(claims.jti)),
            InsertOutcome::Full => Err(AdmitError::UsedTokensFull(claims.jti)),
        }
    }
}

/// Admits the sources of validated knocks.
pub struct AdmitKnockUseCase {
    gate: AdmissionGate,
    service: String,
    tokens: Option<TokenPolicy>,
    admitted: AtomicU64,
    refused: AtomicU64,
}

impl AdmitKnockUseCase {
    /// `tokens` is `None` when the gateway accepts knocks without a
    /// controller token.
    pub fn new(
        gate: AdmissionGate,
        service: impl Into<String>,
        tokens: Option<TokenPolicy>,
    ) -> Self {
        Self {
            gate,
            service: service.into(),
            tokens,
            admitted: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn token_policy(&self) -> Option<&TokenPolicy> {
        self.tokens.as_ref()
    }

    /// Applies the gateway's policy and admits `source` on success.
    ///
    /// # Errors
    ///
    /// Returns the [`AdmitError`] naming the first check that failed.  No
    /// admission entry is written in that case.
    pub fn admit(&self, knock: &ValidatedKnock, source: IpAddr) -> Result<(), AdmitError> {
        let device = &knock.device;
        let device_id = device.device_id.as_str();
        if !device.permits(&self.service) {
            return Err(AdmitError::ServiceNotPermitted {
                device_id: device_id.to_string(),
                service: self.service.clone(),
            });
        }

        if let Some(policy) = &self.tokens {
            let token = knock.token.as_deref().ok_or(AdmitError::MissingToken)?;
            policy.check(token, device_id, &self.service)?;
        }

        self.gate.admit(source, Arc::clone(device));
        Ok(())
    }

    pub fn admitted_count(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub fn refused_count(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }
}

impl KnockHandler for AdmitKnockUseCase {
    fn on_knock(&self, knock: ValidatedKnock, source: SocketAddr) -> Option<Vec<u8>> {
        match self.admit(&knock, source.ip()) {
            Ok(()) => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
                info!(%source, device_id = %knock.device.device_id, "knock admitted");
            }
            Err(e @ (AdmitError::TokenReused(_) | AdmitError::UsedTokensFull(_))) => {
                self.refused.fetch_add(1, Ordering::Relaxed);
                warn!(%source, device_id = %knock.device.device_id, "knock refused: {e}");
            }
            Err(e) => {
                self.refused.fetch_add(1, Ordering::Relaxed);
                debug!(%source, device_id = %knock.device.device_id, "knock refused: {e}");
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::admission_gate::DEFAULT_ADMISSION_TTL;
    use sdp_core::{Device, DeviceId, IdentityBinding, KnockSecret, ManualClock};

    const SERVICE: &str = "ssh";

    struct Fixture {
        clock: Arc<ManualClock>,
        issuer: TokenIssuer,
        use_case: AdmitKnockUseCase,
    }

    fn issuer(clock: &Arc<ManualClock>, issuer: &str) -> TokenIssuer {
        TokenIssuer::new(vec![0x77; 32], issuer, Duration::from_secs(120), clock.clone()).unwrap()
    }

    fn fixture(require_token: bool) -> Fixture {
        fixture_with_capacity(require_token, 64)
    }

    fn fixture_with_capacity(require_token: bool, used_tokens: usize) -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let gate = AdmissionGate::in_memory(clock.clone(), DEFAULT_ADMISSION_TTL, 64);
        let tokens = require_token.then(|| {
            TokenPolicy::in_memory(issuer(&clock, "sdp-controller"), clock.clone(), used_tokens)
        });
        Fixture {
            issuer: issuer(&clock, "sdp-controller"),
            use_case: AdmitKnockUseCase::new(gate, SERVICE, tokens),
            clock,
        }
    }

    fn device(id: &str, services: &[&str]) -> Arc<Device> {
        Arc::new(Device::new(
            DeviceId::new(id).unwrap(),
            KnockSecret::new(vec![9; 16]).unwrap(),
            IdentityBinding::CertFingerprint([0; 32]),
            services.iter().map(|s| s.to_string()).collect(),
        ))
    }

    fn knock(device: Arc<Device>, token: Option<String>) -> ValidatedKnock {
        ValidatedKnock {
            device,
            nonce: [1; 16],
            timestamp: 0,
            token,
        }
    }

    fn source() -> SocketAddr {
        "192.0.2.10:40000".parse().unwrap()
    }

    #[test]
    fn test_knock_without_token_is_admitted_when_tokens_are_optional() {
        // Arrange
        let f = fixture(false);

        // Act
        let reply = f.use_case.on_knock(knock(device("dev-1", &[SERVICE]), None), source());

        // Assert
        assert!(reply.is_none(), "gateway knock port never replies");
        assert!(f.use_case.gate().is_admitted(source().ip()));
        assert_eq!(f.use_case.admitted_count(), 1);
    }

    #[test]
    fn test_device_without_the_service_is_not_admitted() {
        // Arrange
        let f = fixture(false);

        // Act
        let result = f.use_case.admit(&knock(device("dev-1", &["rdp"]), None), source().ip());

        // Assert
        assert!(matches!(result, Err(AdmitError::ServiceNotPermitted { .. })));
        assert!(f.use_case.gate().is_empty());
    }

    #[test]
    fn test_missing_token_is_refused_when_required() {
        let f = fixture(true);
        let result = f.use_case.admit(&knock(device("dev-1", &[SERVICE]), None), source().ip());
        assert_eq!(result, Err(AdmitError::MissingToken));
        assert!(f.use_case.gate().is_empty());
    }

    #[test]
    fn test_valid_token_admits_once_and_reuse_is_refused() {
        // Arrange
        let f = fixture(true);
        let dev = device("dev-1", &[SERVICE]);
        let token = f.issuer.issue(&dev).unwrap();

        // Act
        let first = f
            .use_case
            .admit(&knock(Arc::clone(&dev), Some(token.token.clone())), source().ip());
        let second = f
            .use_case
            .admit(&knock(dev, Some(token.token)), source().ip());

        // Assert
        assert_eq!(first, Ok(()));
        assert_eq!(second, Err(AdmitError::TokenReused(token.claims.jti)));
    }

    #[test]
    fn test_token_for_another_device_is_refused() {
        // Arrange
        let f = fixture(true);
        let other = device("dev-2", &[SERVICE]);
        let token = f.issuer.issue(&other).unwrap().token;

        // Act
        let result = f
            .use_case
            .admit(&knock(device("dev-1", &[SERVICE]), Some(token)), source().ip());

        // Assert
        assert!(matches!(result, Err(AdmitError::SubjectMismatch { .. })));
        assert!(f.use_case.gate().is_empty());
    }

    #[test]
    fn test_token_without_the_service_in_scope_is_refused() {
        // Arrange
        let f = fixture(true);
        let narrow = device("dev-1", &["rdp"]);
        let token = f.issuer.issue(&narrow).unwrap().token;

        // Act
        let result = f
            .use_case
            .admit(&knock(device("dev-1", &[SERVICE]), Some(token)), source().ip());

        // Assert
        assert_eq!(result, Err(AdmitError::OutOfScope(SERVICE.to_string())));
    }

    #[test]
    fn test_expired_token_is_refused() {
        // Arrange
        let f = fixture(true);
        let dev = device("dev-1", &[SERVICE]);
        let token = f.issuer.issue(&dev).unwrap().token;
        f.clock.advance(Duration::from_secs(121));

        // Act
        let result = f.use_case.admit(&knock(dev, Some(token)), source().ip());

        // Assert
        assert!(matches!(result, Err(AdmitError::Token(TokenError::Expired { .. }))));
    }

    #[test]
    fn test_token_signed_by_another_secret_is_refused() {
        // Arrange
        let f = fixture(true);
        let dev = device("dev-1", &[SERVICE]);
        let forger = TokenIssuer::new(
            vec![0x78; 32],
            "sdp-controller",
            Duration::from_secs(120),
            f.clock.clone(),
        )
        .unwrap();
        let token = forger.issue(&dev).unwrap().token;

        // Act
        let result = f.use_case.admit(&knock(dev, Some(token)), source().ip());

        // Assert
        assert_eq!(result, Err(AdmitError::Token(TokenError::BadSignature)));
        assert_eq!(f.use_case.refused_count(), 0, "counters move only through on_knock");
    }

    #[test]
    fn test_refused_token_does_not_burn_its_id() {
        // Arrange
        let f = fixture(true);
        let dev = device("dev-1", &[SERVICE]);
        let token = f.issuer.issue(&dev).unwrap().token;
        let stranger = device("dev-9", &[SERVICE]);

        // Act
        let wrong_device = f
            .use_case
            .admit(&knock(stranger, Some(token.clone())), source().ip());
        let right_device = f.use_case.admit(&knock(dev, Some(token)), source().ip());

        // Assert
        assert!(wrong_device.is_err());
        assert_eq!(right_device, Ok(()));
    }

    #[test]
    fn test_reused_token_is_refused_when_used_list_is_full() {
        // Arrange
        let f = fixture_with_capacity(true, 2);
        let dev = device("dev-1", &[SERVICE]);
        let first = f.issuer.issue(&dev).unwrap();
        let second = f.issuer.issue(&dev).unwrap();
        let third = f.issuer.issue(&dev).unwrap();
        let admit = |token: &str| {
            f.use_case
                .admit(&knock(Arc::clone(&dev), Some(token.to_string())), source().ip())
        };
        assert_eq!(admit(&first.token), Ok(()));
        assert_eq!(admit(&second.token), Ok(()));

        // Act
        let overflow = admit(&third.token);
        let reused = admit(&first.token);

        // Assert
        assert_eq!(overflow, Err(AdmitError::UsedTokensFull(third.claims.jti)));
        assert_eq!(reused, Err(AdmitError::TokenReused(first.claims.jti)));
    }
}
