//! Network infrastructure for the gateway.
//!
//! # Sub-modules
//!
//! - **`spa_listener`** – Binds the gateway's UDP knock port.  Validated
//!   knocks become admission entries; nothing is ever sent back.
//!
//! - **`gateway_listener`** – The TLS port.  Enforces Gate 1 (admission
//!   entry) and Gate 2 (device-bound client certificate) before handing the
//!   connection to the upstream proxy.

pub mod gateway_listener;
pub mod spa_listener;
