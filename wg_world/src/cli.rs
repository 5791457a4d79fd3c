use clap::{Parser, Subcommand};

use std::path::PathBuf;

use wg_world_lib::config;

/// Declarative WireGuard mesh with policy routed egress gateways
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Mesh description file
    #[arg(
        short,
        long,
        env = config::ENV_VAR,
        default_value = config::DEFAULT_PATH
    )]
    pub config_path: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Compile the mesh and apply one host's transaction
    Up { host: String },
    /// Revert a previously applied host transaction
    Down { host: String },
    /// Print one host's compiled transaction without touching the system
    Plan { host: String },
    /// Bring up the local namespace sandbox
    MockUp,
    /// Tear down the local namespace sandbox
    MockDown,
    /// Generate a tunnel key pair and persist it
    Genkey {
        /// Where to write the key record
        #[arg(short, long)]
        out: PathBuf,
    },
}

pub fn parse() -> Cli {
    Cli::parse()
}
