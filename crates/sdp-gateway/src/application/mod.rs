//! Application layer use cases for the gateway.
//!
//! Nothing here touches a socket.  The infrastructure layer hands in
//! validated knocks and peer addresses; these modules decide who may connect.
//!
//! # Sub-modules
//!
//! - **`admission_gate`** – Short-lived, single-use admission entries keyed
//!   by source IP.  Gate 1 of the TLS listener consults it.
//!
//! - **`admit_knock`** – Turns a validated knock (and, when required, the
//!   controller token it carries) into an admission entry.

pub mod admission_gate;
pub mod admit_knock;
