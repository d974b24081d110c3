use clap::Parser;
use tracing_subscriber::EnvFilter;

use igloo_broker::cli::{Cli, Command, run_config_command, run_simulate_command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    match cli.command {
        Command::Config { init } => run_config_command(cli.config.as_deref(), init),
        Command::Simulate(args) => run_simulate_command(cli.config.as_deref(), args).await,
    }
}
