//! Issue a token in response to a validated knock.
//!
//! The controller answers exactly one kind of datagram: a knock that passed
//! every validation stage.  The answer is a [`GrantReply`] carrying a fresh
//! token, authenticated with the device's own knock secret and bound to the
//! knock's nonce, so the device can tell that the reply is genuine and that
//! it answers the knock it just sent.
//!
//! A device with no allowed services has nothing to be granted.  It gets no
//! reply at all, which is indistinguishable from an invalid knock.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sdp_core::knock::seal_grant;
use sdp_core::{GrantReply, KnockHandler, ProtocolError, TokenError, TokenIssuer, ValidatedKnock};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a validated knock produced no grant.
#[derive(Debug, Error)]
pub enum GrantError {
    #[error("token issuance failed: {0}")]
    Token(#[from] TokenError),

    #[error("grant encoding failed: {0}")]
    Encode(#[from] ProtocolError),
}

/// Mints tokens for validated knocks.
pub struct IssueGrantUseCase {
    issuer: Arc<TokenIssuer>,
    issued: AtomicU64,
    refused: AtomicU64,
}

impl IssueGrantUseCase {
    pub fn new(issuer: Arc<TokenIssuer>) -> Self {
        Self {
            issuer,
            issued: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        }
    }

    /// Produces the sealed grant for `knock`, or `None` when the device may
    /// reach no service.
    ///
    /// # Errors
    ///
    /// Returns [`GrantError`] if the token cannot be signed or encoded.
    pub fn grant(&self, knock: &ValidatedKnock) -> Result<Option<Vec<u8>>, GrantError> {
        let device = &knock.device;
        if device.allowed_services.is_empty() {
            self.refused.fetch_add(1, Ordering::Relaxed);
            debug!(device_id = %device.device_id, "device has no services, no grant");
            return Ok(None);
        }

        let issued = self.issuer.issue(device)?;
        let reply = GrantReply {
            nonce: knock.nonce,
            expires_at: issued.claims.exp,
            token: issued.token,
        };
        let bytes = seal_grant(&device.knock_secret, &reply)?;

        self.issued.fetch_add(1, Ordering::Relaxed);
        info!(
            device_id = %device.device_id,
            jti = %issued.claims.jti,
            exp = issued.claims.exp,
            "token issued"
        );
        Ok(Some(bytes))
    }

    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    pub fn refused_count(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }
}

impl KnockHandler for IssueGrantUseCase {
    fn on_knock(&self, knock: ValidatedKnock, source: SocketAddr) -> Option<Vec<u8>> {
        match self.grant(&knock) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(%source, device_id = %knock.device.device_id, "grant failed: {e}");
                None
            }
        }
    }
}
