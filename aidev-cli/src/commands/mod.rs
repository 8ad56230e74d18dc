//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod providers;
mod runs;

pub use providers::ProviderCommands;
pub use runs::RunCommands;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Inspect runs and intervene in them
    Runs {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Provider quota and health
    Providers {
        #[command(subcommand)]
        command: ProviderCommands,
    },
}

/// Routes the command to the appropriate handler module
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Runs { command } => runs::handle_run_command(command, config).await,
        Commands::Providers { command } => {
            providers::handle_provider_command(command, config).await
        }
    }
}
