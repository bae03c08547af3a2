//! Command-line interface for recon-forge.
//!
//! Provides commands to run tasks, inspect and cancel them, adopt finished
//! reconstructions and list the configured variants.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
