//! Domain entities for the admission plane.
//!
//! This module contains pure business rules with no socket or TLS code.
//!
//! # What belongs in the domain? (for beginners)
//!
//! The domain answers questions like "which secret does `dev-1` knock with?"
//! and "does this client certificate belong to `dev-1`?".  Those answers do not
//! depend on whether the bytes arrived over UDP, TCP or a unit test, so the
//! types here can be exercised without opening a single socket.

/// Devices, knock secrets and certificate identity bindings.
pub mod device;
