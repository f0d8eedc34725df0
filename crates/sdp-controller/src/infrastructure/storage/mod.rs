//! Storage infrastructure: configuration file loading.
//!
//! The controller persists nothing at runtime.  Replay records live in
//! memory only; the device list and secrets come from the config file.

pub mod config;
