//! Command-line interface.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "basalt",
    about = "Planning and execution core for an autonomous voxel-world agent",
    version
)]
pub struct Cli {
    /// Explicit config file (defaults to basalt.yaml in the cwd)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the planning core daemon.
    Start {
        /// Override executor mode (shadow | live)
        #[arg(long)]
        mode: Option<String>,

        /// Override the executor poll interval in milliseconds
        #[arg(long)]
        poll_ms: Option<u64>,
    },

    /// Load and validate configuration, then exit.
    ConfigCheck,
}
