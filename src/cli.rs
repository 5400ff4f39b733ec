//! CLI argument parsing and command dispatch

use anyhow::Result;
use clap::{Parser, Subcommand};
use vmr_codeflow::codeflow::FlowDirection;

use crate::commands;

/// VMR CodeFlow - Synchronize repositories with the virtual mono repo
#[derive(Parser, Debug)]
#[command(name = "vmr-codeflow")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Flow a build of a repository into the VMR
    Forward(commands::flow::FlowArgs),

    /// Flow a build of the VMR back into a repository
    Backflow(commands::flow::FlowArgs),
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> Result<()> {
        init_logging(&self.log_level);

        match self.command {
            Commands::Forward(args) => commands::flow::execute(args, FlowDirection::Forward),
            Commands::Backflow(args) => commands::flow::execute(args, FlowDirection::Backflow),
        }
    }
}

/// `RUST_LOG` takes precedence over `--log-level` when set.
fn init_logging(level: &str) {
    let env = env_logger::Env::default().default_filter_or(level);
    // Ignored when a logger is already installed
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .try_init();
}
