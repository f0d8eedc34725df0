//! Short-lived authorization tokens.
//!
//! The controller hands a token to every device whose knock it accepts; the
//! device presents it inside its knock to the gateway.  Tokens are JWTs
//! signed with HMAC-SHA256 (`alg = HS256`) through `jsonwebtoken`.
//!
//! Controller and gateway share the signing secret; that secret is the only
//! trust anchor between them.
//!
//! # Verification order
//!
//! 1. Header parses and `alg` is exactly `HS256`.
//! 2. Signature.
//! 3. Claims parse, issuer matches.
//! 4. Not issued in the future, not expired (`now > exp` is expired).
//!
//! `jsonwebtoken` handles steps 1 to 3.  Step 4 runs against the caller's
//! `now` so that verification stays deterministic under a test clock.

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::errors::{Error as JwtError, ErrorKind};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::domain::device::Device;
use crate::time::Clock;

/// Minimum signing secret length in bytes.
pub const MIN_TOKEN_SECRET_LEN: usize = 32;

/// Default token lifetime.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(120);

/// Shortest lifetime a token can be configured with.
pub const MIN_TOKEN_TTL: Duration = Duration::from_secs(10);

/// Longest lifetime a token can be configured with.
pub const MAX_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

/// Tolerance for an `iat` slightly ahead of the verifier's clock.
pub const IAT_LEEWAY_SECS: i64 = 60;

const ALGORITHM: Algorithm = Algorithm::HS256;

/// Errors raised while issuing or verifying a token.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("unsupported token algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("token signature is invalid")]
    BadSignature,

    #[error("token not issued by {expected:?}")]
    WrongIssuer { expected: String },

    #[error("token expired at {exp}, now {now}")]
    Expired { exp: i64, now: i64 },

    #[error("token issued in the future (iat {iat}, now {now})")]
    NotYetValid { iat: i64, now: i64 },

    #[error("token secret is {0} bytes, minimum is {MIN_TOKEN_SECRET_LEN}")]
    SecretTooShort(usize),

    #[error("token encoding failed: {0}")]
    Encoding(String),
}

/// Claims carried by every token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    /// Device identifier.
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    /// Service tags the device may reach.
    pub scope: Vec<String>,
    /// Unique token id, used by the gateway to refuse reuse.
    pub jti: Uuid,
}

impl TokenClaims {
    pub fn allows(&self, service: &str) -> bool {
        self.scope.iter().any(|s| s == service)
    }
}

/// A freshly signed token together with its claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub claims: TokenClaims,
}

/// Signs and verifies tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    secret: Arc<Zeroizing<Vec<u8>>>,
    issuer: String,
    ttl: Duration,
    validation: Validation,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("issuer", &self.issuer)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    /// Creates an issuer.  `ttl` is clamped to 10 s – 15 min.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::SecretTooShort`] for secrets under 32 bytes.
    pub fn new(
        secret: Vec<u8>,
        issuer: impl Into<String>,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TokenError> {
        if secret.len() < MIN_TOKEN_SECRET_LEN {
            return Err(TokenError::SecretTooShort(secret.len()));
        }
        let issuer = issuer.into();
        Ok(Self {
            secret: Arc::new(Zeroizing::new(secret)),
            validation: validation_for(&issuer),
            issuer,
            ttl: ttl.clamp(MIN_TOKEN_TTL, MAX_TOKEN_TTL),
            clock,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Issues a token for `device`, scoped to its allowed services.
    pub fn issue(&self, device: &Device) -> Result<IssuedToken, TokenError> {
        self.issue_at(device, self.clock.unix_seconds())
    }

    /// Issues a token as if the current time were `now`.
    pub fn issue_at(&self, device: &Device, now: i64) -> Result<IssuedToken, TokenError> {
        let claims = TokenClaims {
            iss: self.issuer.clone(),
            sub: device.device_id.to_string(),
            iat: now,
            exp: now + self.ttl.as_secs() as i64,
            scope: device.allowed_services.clone(),
            jti: Uuid::new_v4(),
        };
        let token = jsonwebtoken::encode(
            &Header::new(ALGORITHM),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(|e| TokenError::Encoding(e.to_string()))?;
        Ok(IssuedToken { token, claims })
    }

    /// Verifies a token against the current time.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, TokenError> {
        self.verify_at(token, self.clock.unix_seconds())
    }

    /// Verifies a token as if the current time were `now`.
    pub fn verify_at(&self, token: &str, now: i64) -> Result<TokenClaims, TokenError> {
        let header = jsonwebtoken::decode_header(token).map_err(|e| self.token_error(e))?;
        if header.alg != ALGORITHM {
            return Err(TokenError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
        }

        let claims = jsonwebtoken::decode::<TokenClaims>(
            token,
            &DecodingKey::from_secret(&self.secret),
            &self.validation,
        )
        .map_err(|e| self.token_error(e))?
        .claims;

        if claims.iat > now + IAT_LEEWAY_SECS {
            return Err(TokenError::NotYetValid {
                iat: claims.iat,
                now,
            });
        }
        if now > claims.exp {
            return Err(TokenError::Expired {
                exp: claims.exp,
                now,
            });
        }
        Ok(claims)
    }

    fn token_error(&self, error: JwtError) -> TokenError {
        match error.kind() {
            ErrorKind::InvalidSignature => TokenError::BadSignature,
            ErrorKind::InvalidIssuer => TokenError::WrongIssuer {
                expected: self.issuer.clone(),
            },
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                TokenError::UnsupportedAlgorithm(error.to_string())
            }
            _ => TokenError::Malformed(error.to_string()),
        }
    }
}

/// HS256 only, issuer pinned.  Time checks are left to [`TokenIssuer::verify_at`].
fn validation_for(issuer: &str) -> Validation {
    let mut validation = Validation::new(ALGORITHM);
    validation.algorithms = vec![ALGORITHM];
    validation.leeway = 0;
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.set_issuer(&[issuer]);
    validation.set_required_spec_claims(&["exp", "iss", "sub"]);
    validation
}
