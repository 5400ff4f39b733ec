//! # VMR CodeFlow CLI
//!
//! This is the binary entry point for the `vmr-codeflow` command-line tool.
//!
//! It parses the command line with `clap` and hands over to the selected
//! command. The synchronization logic itself lives in the `vmr_codeflow`
//! library crate, the binary only wires the process-backed collaborators
//! together and reports the outcome.

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    cli.execute()
}
