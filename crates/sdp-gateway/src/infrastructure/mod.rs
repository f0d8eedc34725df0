//! Infrastructure layer for the gateway.
//!
//! Contains the OS-facing adapters: the UDP knock port, the TLS listener,
//! the upstream proxy and configuration file loading.
//!
//! **Dependency rule**: this layer may depend on `application` and `sdp_core`,
//! but MUST NOT be imported by the `application` layer.

pub mod network;
pub mod proxy;
pub mod runtime;
pub mod storage;
pub mod tls;
