//! Network infrastructure for the host agent.
//!
//! # Sub-modules
//!
//! - **`knock_transport`** – One UDP socket used for every knock of an
//!   attempt and for the controller's grant reply.
//!
//! - **`mtls_dialer`** – Opens the TCP connection to the gateway's TLS port
//!   and completes the handshake with the device's client certificate.

pub mod knock_transport;
pub mod mtls_dialer;
