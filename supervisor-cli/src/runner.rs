//! Glue between argument parsing and the core supervisor.

use crate::adapter::adapt_and_validate;
use crate::parser::Cli;
use anyhow::Result;
use clap::Parser;

/// Parses `args`, validates them, and runs the supervisor to completion.
pub fn run_clap(args: Vec<String>) -> Result<i32> {
    let cli = Cli::parse_from(args);
    let config = adapt_and_validate(cli)?;
    supervisor_core::run(config)
}
