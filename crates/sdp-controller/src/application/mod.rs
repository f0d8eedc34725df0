//! Application layer use cases for the controller.
//!
//! Use cases here orchestrate `sdp_core` types and perform no socket or file
//! I/O; the infrastructure layer feeds them validated knocks and ships their
//! output.
//!
//! # Sub-modules
//!
//! - **`issue_grant`** – Turns a validated knock into a signed token wrapped
//!   in an authenticated grant reply.

pub mod issue_grant;
