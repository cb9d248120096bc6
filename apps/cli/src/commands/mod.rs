//! Command implementations for the Keel CLI.

pub mod print_config;
pub mod train;
