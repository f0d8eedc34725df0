//! Knock validation and construction.
//!
//! # The validation pipeline (for beginners)
//!
//! Every datagram arriving at an SPA port walks the same stages, and any
//! stage can end the walk:
//!
//! ```text
//! RECEIVED ─► DECODED ─► DEVICE_RESOLVED ─► MAC_VERIFIED ─► FRESHNESS_CHECKED ─► REPLAY_CHECKED
//!    │           │              │                 │                 │                  │
//!    └─ drop ────┴── drop ──────┴─── drop ────────┴──── drop ───────┴──── drop ────────┘
//! ```
//!
//! The sender never learns which stage dropped its packet.  The
//! [`KnockRejection`] value exists only so the listener can log and count.
//!
//! The replay guard is written last, after the tag has verified.  Forged or
//! stale packets therefore never occupy space in the guard, and a forged
//! packet cannot "burn" a nonce that the legitimate device later sends.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::domain::device::{Device, DeviceId, KnockSecret};
use crate::protocol::codec::{decode_knock, seal_knock, verify_tag, ProtocolError};
use crate::protocol::messages::{Nonce, MAX_KNOCK_LEN, NONCE_LEN};
use crate::registry::DeviceRegistry;
use crate::replay::ReplayGuard;
use crate::store::InsertOutcome;
use crate::time::Clock;

pub use crate::protocol::codec::{open_grant, seal_grant};

/// Default tolerated difference between sender and receiver clocks.
pub const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::from_secs(30);

/// Why a knock was dropped.  Never sent to the peer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KnockRejection {
    #[error("malformed knock: {0}")]
    Malformed(#[from] ProtocolError),

    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("knock tag does not verify for device {0}")]
    BadTag(DeviceId),

    #[error("knock from {device_id} is stale: timestamp {timestamp}, now {now}")]
    Stale {
        device_id: DeviceId,
        timestamp: i64,
        now: i64,
    },

    #[error("knock from {0} replays an accepted nonce")]
    Replayed(DeviceId),

    #[error("replay guard is full, knock from {0} cannot be recorded")]
    GuardFull(DeviceId),
}

impl KnockRejection {
    /// Short stage label for logs and counters.
    pub fn as_str(&self) -> &'static str {
        match self {
            KnockRejection::Malformed(_) => "malformed",
            KnockRejection::UnknownDevice(_) => "unknown_device",
            KnockRejection::BadTag(_) => "bad_tag",
            KnockRejection::Stale { .. } => "stale",
            KnockRejection::Replayed(_) => "replayed",
            KnockRejection::GuardFull(_) => "guard_full",
        }
    }
}

/// A knock that passed every check.
#[derive(Debug, Clone)]
pub struct ValidatedKnock {
    pub device: Arc<Device>,
    pub nonce: Nonce,
    pub timestamp: i64,
    pub token: Option<String>,
}

// ── Validator ─────────────────────────────────────────────────────────────────

/// Runs the knock pipeline.  One instance is shared by every task of a listener.
pub struct KnockValidator {
    registry: Arc<dyn DeviceRegistry>,
    replay: ReplayGuard,
    clock: Arc<dyn Clock>,
    max_skew: Duration,
    decoy_key: [u8; 32],
}

impl KnockValidator {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        replay: ReplayGuard,
        clock: Arc<dyn Clock>,
        max_skew: Duration,
    ) -> Self {
        let mut decoy_key = [0u8; 32];
        OsRng.fill_bytes(&mut decoy_key);
        Self {
            registry,
            replay,
            clock,
            max_skew,
            decoy_key,
        }
    }

    pub fn replay_guard(&self) -> &ReplayGuard {
        &self.replay
    }

    pub fn max_skew(&self) -> Duration {
        self.max_skew
    }

    /// Validates one datagram.
    ///
    /// # Errors
    ///
    /// Returns the [`KnockRejection`] naming the first stage that failed.
    pub fn validate(&self, datagram: &[u8]) -> Result<ValidatedKnock, KnockRejection> {
        // DECODED
        let decoded = decode_knock(datagram)?;
        let packet = decoded.packet;

        // DEVICE_RESOLVED
        let Some(device) = self.registry.lookup(&packet.device_id) else {
            self.spend_decoy_mac(decoded.authenticated);
            return Err(KnockRejection::UnknownDevice(packet.device_id));
        };

        // MAC_VERIFIED
        if !verify_tag(&device.knock_secret, decoded.authenticated, &packet.tag) {
            return Err(KnockRejection::BadTag(packet.device_id));
        }

        // FRESHNESS_CHECKED
        let now = self.clock.unix_seconds();
        if now.abs_diff(packet.timestamp) > self.max_skew.as_secs() {
            return Err(KnockRejection::Stale {
                device_id: packet.device_id,
                timestamp: packet.timestamp,
                now,
            });
        }

        // REPLAY_CHECKED
        match self.replay.record(&packet.device_id, &packet.nonce) {
            InsertOutcome::Stored => {}
            InsertOutcome::Present => return Err(KnockRejection::Replayed(packet.device_id)),
            InsertOutcome::Full => return Err(KnockRejection::GuardFull(packet.device_id)),
        }

        debug!(device_id = %packet.device_id, "knock validated");
        Ok(ValidatedKnock {
            device,
            nonce: packet.nonce,
            timestamp: packet.timestamp,
            token: packet.token,
        })
    }

    /// Computes an HMAC with a throwaway key so that unknown devices cost the
    /// same as known ones.
    fn spend_decoy_mac(&self, data: &[u8]) {
        if let Ok(mut mac) = <Hmac<Sha256> as Mac>::new_from_slice(&self.decoy_key) {
            mac.update(data);
            let _ = mac.finalize();
        }
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

/// A sealed knock and the nonce it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltKnock {
    pub bytes: Vec<u8>,
    pub nonce: Nonce,
}

/// Produces knocks for one device.  Used by the host agent.
#[derive(Debug, Clone)]
pub struct KnockBuilder {
    device_id: DeviceId,
    secret: KnockSecret,
}

impl KnockBuilder {
    pub fn new(device_id: DeviceId, secret: KnockSecret) -> Self {
        Self { device_id, secret }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn secret(&self) -> &KnockSecret {
        &self.secret
    }

    /// Builds a knock with a fresh random nonce.
    pub fn build(&self, timestamp: i64, token: Option<&str>) -> Result<BuiltKnock, ProtocolError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        self.build_with_nonce(timestamp, nonce, token)
    }

    /// Builds a knock with a caller-chosen nonce.
    pub fn build_with_nonce(
        &self,
        timestamp: i64,
        nonce: Nonce,
        token: Option<&str>,
    ) -> Result<BuiltKnock, ProtocolError> {
        let bytes = seal_knock(&self.secret, &self.device_id, timestamp, &nonce, token)?;
        debug_assert!(bytes.len() <= MAX_KNOCK_LEN);
        Ok(BuiltKnock { bytes, nonce })
    }
}
