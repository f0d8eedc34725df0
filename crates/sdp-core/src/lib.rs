//! # sdp-core
//!
//! Shared library for the SDP admission plane containing the knock protocol
//! codec, the device registry, the expiring stores behind the replay guard and
//! the admission gate, the token issuer, the knock validator, and the TLS
//! helpers used on both ends of the mTLS connection.
//!
//! This crate is used by the controller, the gateway and the host agent.
//!
//! # Architecture overview (for beginners)
//!
//! A *software-defined perimeter* hides a TCP service until a device has
//! proven itself twice:
//!
//! 1. It sends a single authenticated UDP packet (a *knock*, also called
//!    Single Packet Authorization).  Nobody answers an invalid knock; the
//!    listening port looks closed to a scanner.
//! 2. It opens a mutual-TLS connection and presents a certificate that the
//!    registry binds to the same device.
//!
//! This crate is the shared foundation.  It defines:
//!
//! - **`protocol`** – The versioned byte layout of knocks and grant replies
//!   and the HMAC that authenticates them.
//!
//! - **`domain`** – Devices, their knock secrets, and the rule binding a
//!   device to a client certificate.
//!
//! - **`registry`** – The read-mostly device lookup used on every knock and
//!   every handshake.
//!
//! - **`store`** / **`replay`** – Concurrent maps whose entries expire on
//!   their own, and the replay guard built on top of them.
//!
//! - **`token`** – Short-lived signed authorization tokens.
//!
//! - **`knock`** – The validation pipeline shared by both SPA listeners and
//!   the builder the agent uses to produce knocks.
//!
//! - **`listener`** – The UDP receive loop both SPA listeners run.
//!
//! - **`tls`** – PEM loading and the rustls verifiers that enforce the
//!   device identity binding.

pub mod domain;
pub mod knock;
pub mod listener;
pub mod protocol;
pub mod registry;
pub mod replay;
pub mod store;
pub mod time;
pub mod tls;
pub mod token;

// Re-export the most-used types at the crate root so callers can write
// `sdp_core::KnockValidator` instead of `sdp_core::knock::validator::KnockValidator`.
pub use domain::device::{Device, DeviceError, DeviceId, IdentityBinding, KnockSecret, PresentedIdentity};
pub use knock::{BuiltKnock, KnockBuilder, KnockRejection, KnockValidator, ValidatedKnock};
pub use listener::{KnockHandler, SpaListener, SpaListenerConfig};
pub use protocol::codec::ProtocolError;
pub use protocol::messages::{GrantReply, Nonce};
pub use registry::{DeviceEntry, DeviceRegistry, InMemoryRegistry, RegistryError};
pub use replay::ReplayGuard;
pub use store::{ExpiringStore, InsertOutcome, Overflow, ShardedExpiringStore};
pub use time::{Clock, ManualClock, SystemClock};
pub use token::{IssuedToken, TokenClaims, TokenError, TokenIssuer};
