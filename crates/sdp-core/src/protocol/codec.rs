//! Binary codec for knocks and grant replies.
//!
//! Knock, version 1 (all integers big-endian):
//! ```text
//! [version:1][type:1][id_len:1][device_id:N][timestamp:8][nonce:16][token_len:2][token:T][tag:32]
//! ```
//! `tag = HMAC-SHA256(knock_secret, every preceding byte)`.  The device id is
//! covered by the tag, so it cannot be swapped without the secret.
//!
//! Grant reply, version 1:
//! ```text
//! [version:1][type:1][nonce:16][expires_at:8][token_len:2][token:T][tag:32]
//! ```
//! `tag = HMAC-SHA256(knock_secret, "sdp-grant-v1" || every preceding byte)`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::domain::device::{DeviceId, KnockSecret, MAX_DEVICE_ID_LEN};
use crate::protocol::messages::{
    GrantReply, KnockPacket, MessageType, Nonce, GRANT_FIXED_LEN, GRANT_TAG_CONTEXT,
    KNOCK_FIXED_LEN, MAX_GRANT_LEN, MAX_KNOCK_LEN, MAX_TOKEN_LEN, MIN_KNOCK_LEN, NONCE_LEN,
    PROTOCOL_VERSION, TAG_LEN,
};

type HmacSha256 = Hmac<Sha256>;

/// Errors that can occur while encoding or decoding a datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The datagram is larger than any valid message of its kind.
    #[error("datagram of {size} bytes exceeds maximum of {max}")]
    Oversized { size: usize, max: usize },

    /// The message type byte is not a recognized value.
    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// The message type is valid but not the one expected here.
    #[error("expected {expected:?} message, got {found:?}")]
    UnexpectedMessageType {
        expected: MessageType,
        found: MessageType,
    },

    /// The protocol version is not supported.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// A field value is out of range, not UTF-8, or followed by stray bytes.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The declared lengths do not add up to the datagram length.
    #[error("length mismatch: fields declare {declared} bytes, datagram has {available}")]
    PayloadLengthMismatch { declared: usize, available: usize },

    /// The HMAC tag does not verify.
    #[error("authentication tag mismatch")]
    BadTag,

    /// A grant answers a different knock.
    #[error("grant nonce does not match the knock")]
    NonceMismatch,

    /// The HMAC key was rejected.
    #[error("invalid HMAC key")]
    InvalidKey,
}

/// A knock parsed from a datagram, borrowing the bytes its tag covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedKnock<'a> {
    pub packet: KnockPacket,
    /// Every byte of the datagram except the trailing tag.
    pub authenticated: &'a [u8],
}

// ── Knock ─────────────────────────────────────────────────────────────────────

/// Encodes and authenticates a knock.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] when the token is longer than
/// [`MAX_TOKEN_LEN`] or not ASCII.
///
/// # Examples
///
/// ```rust
/// use sdp_core::domain::device::{DeviceId, KnockSecret};
/// use sdp_core::protocol::{decode_knock, seal_knock, verify_tag};
///
/// let id = DeviceId::new("dev-1").unwrap();
/// let secret = KnockSecret::new(vec![9u8; 32]).unwrap();
/// let bytes = seal_knock(&secret, &id, 1_700_000_000, &[1u8; 16], None).unwrap();
///
/// let decoded = decode_knock(&bytes).unwrap();
/// assert_eq!(decoded.packet.device_id, id);
/// assert!(verify_tag(&secret, decoded.authenticated, &decoded.packet.tag));
/// ```
pub fn seal_knock(
    secret: &KnockSecret,
    device_id: &DeviceId,
    timestamp: i64,
    nonce: &Nonce,
    token: Option<&str>,
) -> Result<Vec<u8>, ProtocolError> {
    let token = token.unwrap_or("");
    check_token(token, 0)?;

    let id = device_id.as_bytes();
    let mut buf = Vec::with_capacity(KNOCK_FIXED_LEN + id.len() + token.len());
    buf.push(PROTOCOL_VERSION);
    buf.push(MessageType::Knock as u8);
    buf.push(id.len() as u8);
    buf.extend_from_slice(id);
    buf.extend_from_slice(&timestamp.to_be_bytes());
    buf.extend_from_slice(nonce);
    buf.extend_from_slice(&(token.len() as u16).to_be_bytes());
    buf.extend_from_slice(token.as_bytes());

    let tag = compute_tag(secret, &[buf.as_slice()])?;
    buf.extend_from_slice(&tag);
    Ok(buf)
}

/// Parses a knock without verifying its tag.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the bytes are not a well-formed version 1
/// knock, including when bytes follow the tag.
pub fn decode_knock(bytes: &[u8]) -> Result<DecodedKnock<'_>, ProtocolError> {
    if bytes.len() > MAX_KNOCK_LEN {
        return Err(ProtocolError::Oversized {
            size: bytes.len(),
            max: MAX_KNOCK_LEN,
        });
    }
    if bytes.len() < MIN_KNOCK_LEN {
        return Err(ProtocolError::InsufficientData {
            needed: MIN_KNOCK_LEN,
            available: bytes.len(),
        });
    }
    check_header(bytes, MessageType::Knock)?;

    let id_len = bytes[2] as usize;
    if id_len == 0 || id_len > MAX_DEVICE_ID_LEN {
        return Err(ProtocolError::MalformedPayload(format!(
            "device id length {id_len} outside 1..={MAX_DEVICE_ID_LEN}"
        )));
    }
    let without_token = KNOCK_FIXED_LEN + id_len;
    if bytes.len() < without_token {
        return Err(ProtocolError::InsufficientData {
            needed: without_token,
            available: bytes.len(),
        });
    }

    let id_str = std::str::from_utf8(&bytes[3..3 + id_len])
        .map_err(|e| ProtocolError::MalformedPayload(format!("device id is not UTF-8: {e}")))?;
    let device_id = DeviceId::new(id_str)
        .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;

    let mut offset = 3 + id_len;
    let timestamp = read_i64(bytes, offset)?;
    offset += 8;
    let nonce = read_nonce(bytes, offset)?;
    offset += NONCE_LEN;
    let token_len = read_u16(bytes, offset)? as usize;
    offset += 2;
    if token_len > MAX_TOKEN_LEN {
        return Err(ProtocolError::MalformedPayload(format!(
            "token length {token_len} exceeds {MAX_TOKEN_LEN}"
        )));
    }
    check_exact_len(bytes, without_token + token_len)?;

    let token = if token_len == 0 {
        None
    } else {
        Some(read_ascii(&bytes[offset..offset + token_len])?)
    };
    offset += token_len;

    let tag = read_tag(bytes, offset)?;
    Ok(DecodedKnock {
        packet: KnockPacket {
            device_id,
            timestamp,
            nonce,
            token,
            tag,
        },
        authenticated: &bytes[..offset],
    })
}

// ── Grant ─────────────────────────────────────────────────────────────────────

/// Encodes and authenticates a grant reply.
pub fn seal_grant(secret: &KnockSecret, grant: &GrantReply) -> Result<Vec<u8>, ProtocolError> {
    check_token(&grant.token, 1)?;

    let mut buf = Vec::with_capacity(GRANT_FIXED_LEN + grant.token.len());
    buf.push(PROTOCOL_VERSION);
    buf.push(MessageType::Grant as u8);
    buf.extend_from_slice(&grant.nonce);
    buf.extend_from_slice(&grant.expires_at.to_be_bytes());
    buf.extend_from_slice(&(grant.token.len() as u16).to_be_bytes());
    buf.extend_from_slice(grant.token.as_bytes());

    let tag = compute_tag(secret, &[GRANT_TAG_CONTEXT, buf.as_slice()])?;
    buf.extend_from_slice(&tag);
    Ok(buf)
}

/// Parses and authenticates a grant reply to the knock carrying `expected_nonce`.
///
/// # Errors
///
/// Returns [`ProtocolError::BadTag`] when the reply was not produced with
/// `secret`, and [`ProtocolError::NonceMismatch`] when it answers another knock.
pub fn open_grant(
    secret: &KnockSecret,
    bytes: &[u8],
    expected_nonce: &Nonce,
) -> Result<GrantReply, ProtocolError> {
    if bytes.len() > MAX_GRANT_LEN {
        return Err(ProtocolError::Oversized {
            size: bytes.len(),
            max: MAX_GRANT_LEN,
        });
    }
    if bytes.len() < GRANT_FIXED_LEN + 1 {
        return Err(ProtocolError::InsufficientData {
            needed: GRANT_FIXED_LEN + 1,
            available: bytes.len(),
        });
    }
    check_header(bytes, MessageType::Grant)?;

    let nonce = read_nonce(bytes, 2)?;
    let expires_at = read_i64(bytes, 2 + NONCE_LEN)?;
    let token_offset = 2 + NONCE_LEN + 8 + 2;
    let token_len = read_u16(bytes, token_offset - 2)? as usize;
    if token_len == 0 || token_len > MAX_TOKEN_LEN {
        return Err(ProtocolError::MalformedPayload(format!(
            "grant token length {token_len} outside 1..={MAX_TOKEN_LEN}"
        )));
    }
    check_exact_len(bytes, GRANT_FIXED_LEN + token_len)?;

    let tag_offset = token_offset + token_len;
    let tag = read_tag(bytes, tag_offset)?;
    if !verify_tag_parts(secret, &[GRANT_TAG_CONTEXT, &bytes[..tag_offset]], &tag)? {
        return Err(ProtocolError::BadTag);
    }
    if !bool::from(nonce.ct_eq(expected_nonce)) {
        return Err(ProtocolError::NonceMismatch);
    }

    let token = read_ascii(&bytes[token_offset..tag_offset])?;
    Ok(GrantReply {
        nonce,
        expires_at,
        token,
    })
}

// ── Authentication ────────────────────────────────────────────────────────────

/// HMAC-SHA256 over the concatenation of `parts`.
pub fn compute_tag(secret: &KnockSecret, parts: &[&[u8]]) -> Result<[u8; TAG_LEN], ProtocolError> {
    let mut mac = keyed(secret.expose())?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Verifies `tag` over `data` in constant time.
pub fn verify_tag(secret: &KnockSecret, data: &[u8], tag: &[u8; TAG_LEN]) -> bool {
    verify_tag_parts(secret, &[data], tag).unwrap_or(false)
}

fn verify_tag_parts(
    secret: &KnockSecret,
    parts: &[&[u8]],
    tag: &[u8; TAG_LEN],
) -> Result<bool, ProtocolError> {
    let mut mac = keyed(secret.expose())?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.verify_slice(tag).is_ok())
}

fn keyed(key: &[u8]) -> Result<HmacSha256, ProtocolError> {
    <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| ProtocolError::InvalidKey)
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn check_header(bytes: &[u8], expected: MessageType) -> Result<(), ProtocolError> {
    if bytes[0] != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(bytes[0]));
    }
    let found =
        MessageType::try_from(bytes[1]).map_err(|_| ProtocolError::UnknownMessageType(bytes[1]))?;
    if found != expected {
        return Err(ProtocolError::UnexpectedMessageType { expected, found });
    }
    Ok(())
}

fn check_token(token: &str, min_len: usize) -> Result<(), ProtocolError> {
    if token.len() < min_len || token.len() > MAX_TOKEN_LEN {
        return Err(ProtocolError::MalformedPayload(format!(
            "token length {} outside {min_len}..={MAX_TOKEN_LEN}",
            token.len()
        )));
    }
    if !token.is_ascii() {
        return Err(ProtocolError::MalformedPayload("token is not ASCII".to_string()));
    }
    Ok(())
}

fn check_exact_len(bytes: &[u8], declared: usize) -> Result<(), ProtocolError> {
    if bytes.len() < declared {
        return Err(ProtocolError::PayloadLengthMismatch {
            declared,
            available: bytes.len(),
        });
    }
    if bytes.len() > declared {
        return Err(ProtocolError::MalformedPayload(format!(
            "{} trailing bytes after tag",
            bytes.len() - declared
        )));
    }
    Ok(())
}

fn read_array<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N], ProtocolError> {
    buf.get(offset..offset + N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or(ProtocolError::InsufficientData {
            needed: offset + N,
            available: buf.len(),
        })
}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16, ProtocolError> {
    read_array::<2>(buf, offset).map(u16::from_be_bytes)
}

fn read_i64(buf: &[u8], offset: usize) -> Result<i64, ProtocolError> {
    read_array::<8>(buf, offset).map(i64::from_be_bytes)
}

fn read_nonce(buf: &[u8], offset: usize) -> Result<Nonce, ProtocolError> {
    read_array::<NONCE_LEN>(buf, offset)
}

fn read_tag(buf: &[u8], offset: usize) -> Result<[u8; TAG_LEN], ProtocolError> {
    read_array::<TAG_LEN>(buf, offset)
}

fn read_ascii(bytes: &[u8]) -> Result<String, ProtocolError> {
    if !bytes.is_ascii() {
        return Err(ProtocolError::MalformedPayload("token is not ASCII".to_string()));
    }
    // ASCII is always valid UTF-8.
    Ok(bytes.iter().map(|&b| b as char).collect())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
