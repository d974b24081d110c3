//! Command-line surface for `igloo-broker`.

mod config;
mod simulate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use self::config::run_config_command;
pub use self::simulate::{DemoSigner, SimulateArgs, run_simulate_command};

#[derive(Parser, Debug)]
#[command(name = "igloo-broker", version, about = "NIP-55 signing request broker")]
pub struct Cli {
    /// TOML config file (defaults to ~/.igloo/broker.toml when present).
    #[arg(long, global = true, env = "BROKER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the resolved configuration.
    Config {
        /// Write a default config file if none exists yet.
        #[arg(long)]
        init: bool,
    },
    /// Run a cold-start burst against an in-process demo signer.
    Simulate(SimulateArgs),
}
