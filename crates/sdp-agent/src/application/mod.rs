//! Application layer for the host agent.

/// The single-attempt knock-and-connect state machine.
pub mod sequencer;
