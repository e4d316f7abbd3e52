//! Translation worker process: configuration, CLI and startup wiring.

pub mod cli;
pub mod config;
pub mod startup;
