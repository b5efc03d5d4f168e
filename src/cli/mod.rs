//! Command-line interface for puzzle-forge.
//!
//! Provides one command per model-backed stage plus the `filter` and
//! `status` file commands.

mod commands;

pub use commands::{parse_cli, run_with_cli};
