//! Infrastructure layer for the host agent.
//!
//! Contains the UDP knock transport, the rustls dialer and configuration file
//! loading.  Both network adapters implement traits declared by
//! `application::sequencer`.
//!
//! **Dependency rule**: this layer may depend on `application` and `sdp_core`,
//! but MUST NOT be imported by the `application` layer.

pub mod network;
pub mod storage;
