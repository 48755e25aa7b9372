//! Command-line interface for pipeforge.
//!
//! Provides the long-running `serve` command plus operator commands for
//! registering repositories, updating pipeline configs, one-shot triggers,
//! and spec validation.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli};
