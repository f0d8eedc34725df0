//! Network infrastructure for the controller.
//!
//! # Sub-modules
//!
//! - **`spa_listener`** – Binds the controller's UDP knock port and answers
//!   every knock that passes validation with a sealed grant reply.  Invalid
//!   knocks get no answer at all.

pub mod spa_listener;
