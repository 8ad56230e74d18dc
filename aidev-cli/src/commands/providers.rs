//! Provider command handlers

use aidev_client::OperatorClient;
use aidev_core::domain::provider::HealthStatus;
use aidev_core::dto::provider::ProviderStatus;
use anyhow::Result;
use clap::Subcommand;
use colored::*;

use crate::config::Config;

/// Provider subcommands
#[derive(Subcommand)]
pub enum ProviderCommands {
    /// List providers with their quota usage and health
    List,
}

/// Handle provider commands
pub async fn handle_provider_command(command: ProviderCommands, config: &Config) -> Result<()> {
    let client = OperatorClient::new(&config.api_url);

    match command {
        ProviderCommands::List => list_providers(&client).await,
    }
}

async fn list_providers(client: &OperatorClient) -> Result<()> {
    let providers = client.list_providers().await?;

    if providers.is_empty() {
        println!("{}", "No providers registered.".yellow());
        return Ok(());
    }

    println!("{}", format!("Found {} provider(s):", providers.len()).bold());
    println!();
    for provider in &providers {
        print_provider(provider);
    }

    Ok(())
}

fn usage(used: u64, max: Option<u64>) -> String {
    match max {
        Some(max) => format!("{}/{}", used, max),
        None => format!("{} (unlimited)", used),
    }
}

fn print_provider(provider: &ProviderStatus) {
    let health = provider.health.to_string();
    let health = match provider.health {
        HealthStatus::Healthy => health.green(),
        HealthStatus::Degraded => health.yellow(),
        HealthStatus::Exhausted => health.red(),
    };

    println!("  {} {} {}", "▸".cyan(), provider.id.bold(), health);
    println!(
        "    Roles:    {}",
        provider
            .roles
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(", ")
            .dimmed()
    );
    println!(
        "    Requests: {}",
        usage(provider.requests, provider.max_requests)
    );
    println!("    Tokens:   {}", usage(provider.tokens, provider.max_tokens));
    if provider.consecutive_failures > 0 {
        println!(
            "    Failures: {}",
            provider.consecutive_failures.to_string().red()
        );
    }
    if let Some(kind) = &provider.last_error {
        let at = provider
            .last_error_at
            .map(|t| format!(" at {}", t.format("%Y-%m-%d %H:%M:%S")))
            .unwrap_or_default();
        println!("    Last error: {}{}", kind.to_string().red(), at.dimmed());
    }
    if let Some(until) = provider.backoff_until {
        println!(
            "    Backoff until:   {}",
            until.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
        );
    }
    if let Some(until) = provider.exhausted_until {
        println!(
            "    Exhausted until: {}",
            until.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
        );
    }
    println!();
}
