//! # sdp-agent (library root)
//!
//! The host agent runs on the device that wants to reach a protected
//! service.  It performs the whole proof-and-connect sequence once:
//!
//! 1. knock the controller and wait for a sealed grant carrying a token
//!    (skipped in gateway-direct deployments);
//! 2. knock the gateway, presenting the token;
//! 3. dial the gateway's TLS port with the device's client certificate.
//!
//! The crate follows the same layering as the controller and the gateway:
//!
//! - **`application`** – the sequencer state machine.  It talks to the
//!   network only through the [`KnockTransport`] and [`MtlsDialer`] traits,
//!   so every failure path is testable without sockets.
//!
//! - **`infrastructure`** – the UDP transport, the rustls dialer and the TOML
//!   configuration.
//!
//! [`KnockTransport`]: application::sequencer::KnockTransport
//! [`MtlsDialer`]: application::sequencer::MtlsDialer

pub mod application;
pub mod infrastructure;
