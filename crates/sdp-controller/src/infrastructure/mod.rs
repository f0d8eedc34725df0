//! Infrastructure layer for the controller.
//!
//! Contains the OS-facing adapters: the UDP knock port, the HTTP token API
//! and configuration file loading.
//!
//! **Dependency rule**: this layer may depend on `application` and `sdp_core`,
//! but MUST NOT be imported by the `application` layer.

pub mod http;
pub mod network;
pub mod runtime;
pub mod storage;
