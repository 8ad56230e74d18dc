//! AIDev CLI
//!
//! Command-line interface for operating the AIDev daemon.

mod commands;
mod config;
mod id_resolver;
mod types;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;

#[derive(Parser)]
#[command(name = "aidev")]
#[command(about = "AIDev autonomous issue resolution CLI", long_about = None)]
struct Cli {
    /// Daemon operator API URL
    #[arg(long, env = "AIDEV_API_URL", default_value = "http://localhost:8700")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config {
        api_url: cli.api_url,
    };

    handle_command(cli.command, &config).await
}
