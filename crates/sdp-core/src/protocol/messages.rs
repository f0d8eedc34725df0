//! Knock and grant message types.
//!
//! Both messages travel as single UDP datagrams.  The byte layouts are
//! documented in [`crate::protocol::codec`].

use serde::{Deserialize, Serialize};

use crate::domain::device::{DeviceId, MAX_DEVICE_ID_LEN};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Current protocol version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Length of a knock nonce in bytes.
pub const NONCE_LEN: usize = 16;

/// Length of an HMAC-SHA256 tag in bytes.
pub const TAG_LEN: usize = 32;

/// Largest token a knock or grant may carry, in bytes.
pub const MAX_TOKEN_LEN: usize = 1024;

/// Knock bytes that do not depend on the device id or token length:
/// version, type, id length, timestamp, nonce, token length, tag.
pub const KNOCK_FIXED_LEN: usize = 1 + 1 + 1 + 8 + NONCE_LEN + 2 + TAG_LEN;

/// Smallest possible knock (one-byte device id, no token).
pub const MIN_KNOCK_LEN: usize = KNOCK_FIXED_LEN + 1;

/// Largest possible knock.  Datagrams above this size are dropped unparsed.
pub const MAX_KNOCK_LEN: usize = KNOCK_FIXED_LEN + MAX_DEVICE_ID_LEN + MAX_TOKEN_LEN;

/// Grant bytes that do not depend on the token length.
pub const GRANT_FIXED_LEN: usize = 1 + 1 + NONCE_LEN + 8 + 2 + TAG_LEN;

/// Largest possible grant reply.
pub const MAX_GRANT_LEN: usize = GRANT_FIXED_LEN + MAX_TOKEN_LEN;

/// Domain-separation prefix mixed into the grant tag so a grant can never be
/// mistaken for a knock authenticated with the same secret.
pub const GRANT_TAG_CONTEXT: &[u8] = b"sdp-grant-v1";

/// 16 random bytes that make each knock unique.
pub type Nonce = [u8; NONCE_LEN];

// ── Message type codes ────────────────────────────────────────────────────────

/// Message type byte at offset 1 of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Knock = 0x01,
    Grant = 0x02,
}

impl TryFrom<u8> for MessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(MessageType::Knock),
            0x02 => Ok(MessageType::Grant),
            _ => Err(()),
        }
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// A decoded knock.
///
/// Decoding does not check the tag; that needs the device's secret, which is
/// only known after `device_id` has been looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnockPacket {
    pub device_id: DeviceId,
    /// Unix seconds on the sender's clock.
    pub timestamp: i64,
    pub nonce: Nonce,
    /// A controller-issued token presented to the gateway, if any.
    pub token: Option<String>,
    pub tag: [u8; TAG_LEN],
}

/// The controller's answer to a validated knock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantReply {
    /// Nonce of the knock being answered.
    pub nonce: Nonce,
    /// Token expiry in Unix seconds.
    pub expires_at: i64,
    /// Compact JWS token.
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_limits_fit_one_unfragmented_datagram() {
        assert_eq!(MAX_KNOCK_LEN, 1149);
        assert_eq!(MAX_GRANT_LEN, 1084);
        assert!(MAX_KNOCK_LEN < 1232, "stays under the IPv6 minimum path MTU payload");
    }

    #[test]
    fn test_message_type_try_from_rejects_unknown_codes() {
        assert_eq!(MessageType::try_from(0x01), Ok(MessageType::Knock));
        assert_eq!(MessageType::try_from(0x02), Ok(MessageType::Grant));
        assert_eq!(MessageType::try_from(0x7F), Err(()));
    }
}
