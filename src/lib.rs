//! Relay gateway — library crate.
//!
//! The binary in `main.rs` and the integration tests in `tests/` both build
//! on these modules.

pub mod auth;
pub mod cli;
pub mod config;
pub mod errors;
pub mod models;
pub mod relay;
pub mod scheduler;
pub mod store;
