//! Shared types, errors, configuration and metrics hooks for the tally crates.

pub mod config;
pub mod error;
pub mod metrics;
pub mod types;
