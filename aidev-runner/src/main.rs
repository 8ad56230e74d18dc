//! AIDev Daemon
//!
//! Watches issue trackers for labelled issues and drives each one through
//! plan, code, safety review, sandboxed tests and commit, using a pool of
//! interchangeable AI providers.
//!
//! Architecture:
//! - Configuration: TOML file plus environment overrides
//! - Repositories: issue tracker, git, podman sandbox, checkpoints, audit log
//! - Services: context building, safety review, the resolution pipeline
//! - Scheduler: run table, admission under the concurrency ceiling, polling
//! - API: operator endpoints for inspection and manual intervention

mod api;
mod config;
mod repository;
mod scheduler;
mod service;
#[cfg(test)]
mod testing;

use aidev_gateway::{AiGateway, OpenAiProvider, ProviderRegistry};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::repository::{
    FileCheckpointStore, GitHubIssueSource, GitSourceControl, JsonlAuditLog, PodmanSandbox,
    check_podman_available,
};
use crate::scheduler::{IssuePoller, Scheduler, run_tick_loop};
use crate::service::{Collaborators, Pipeline, PipelineSettings};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aidevd=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting AIDev daemon");

    let config = Config::load()?;
    config.validate()?;
    info!(
        "Loaded configuration: {} project(s), {} provider(s), {} worker(s), {} sandbox slot(s)",
        config.projects.len(),
        config.providers.len(),
        config.daemon.max_workers,
        config.daemon.max_concurrent_runs
    );
    if config.github_token.is_none() {
        warn!("GITHUB_TOKEN is not set; issue tracker calls are unauthenticated");
    }

    check_podman_available()?;

    let gateway = Arc::new(build_gateway(&config).await?);
    info!("AI gateway initialized");

    let state_dir = &config.daemon.state_dir;
    let issues = Arc::new(GitHubIssueSource::new(
        config.daemon.github_api_url.clone(),
        config.github_token.clone(),
    ));
    let deps = Collaborators {
        issues: issues.clone(),
        scm: Arc::new(GitSourceControl::new(
            config.daemon.git_author_name.clone(),
            config.daemon.git_author_email.clone(),
        )),
        sandbox: Arc::new(PodmanSandbox::new()),
        checkpoints: Arc::new(
            FileCheckpointStore::open(state_dir)
                .await
                .with_context(|| format!("Failed to open checkpoint store in {}", state_dir.display()))?,
        ),
        audit: Arc::new(
            JsonlAuditLog::open(state_dir)
                .await
                .with_context(|| format!("Failed to open audit log in {}", state_dir.display()))?,
        ),
    };
    let settings = PipelineSettings {
        budgets: config.retries,
        collaborator_timeout: config.collaborator_timeout(),
        retry_backoff: std::time::Duration::from_millis(config.daemon.retry_backoff_ms),
        ai_review: config.daemon.ai_review,
        sandbox_slots: config.daemon.max_concurrent_runs,
    };
    let pipeline = Arc::new(Pipeline::new(gateway, deps, config.projects.clone(), settings));

    let scheduler = Arc::new(Scheduler::new(
        pipeline,
        config.daemon.max_workers,
        config.retries,
    ));
    let resumable = scheduler
        .recover()
        .await
        .context("Failed to recover runs from checkpoints")?;
    info!("{} run(s) will resume from their last checkpoint", resumable);

    let shutdown = CancellationToken::new();

    let poller = IssuePoller::new(
        scheduler.clone(),
        issues,
        config.projects.clone(),
        config.daemon.trigger_label.clone(),
        config.poll_interval(),
    );
    let poller_shutdown = shutdown.clone();
    let poller_handle = tokio::spawn(async move { poller.run(poller_shutdown).await });

    let tick_handle = tokio::spawn(run_tick_loop(
        scheduler.clone(),
        config.tick_interval(),
        shutdown.clone(),
    ));

    let scheduler_handle = scheduler.clone();
    let app = api::create_router(scheduler);
    let addr = &config.daemon.api_bind_addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Operator API listening on {}", addr);

    let server_shutdown = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested");
            server_shutdown.cancel();
        })
        .await;

    shutdown.cancel();
    for handle in [poller_handle, tick_handle] {
        if let Err(e) = handle.await {
            warn!("Background task panicked: {}", e);
        }
    }

    let in_flight = scheduler_handle.active_count().await;
    served.context("Operator API failed")?;
    info!(
        "AIDev daemon stopped with {} run(s) in flight; they resume from their checkpoints on restart",
        in_flight
    );
    Ok(())
}

/// Registers every configured provider, binds roles and wires the HTTP
/// clients into a gateway
async fn build_gateway(config: &Config) -> Result<AiGateway> {
    let registry = Arc::new(ProviderRegistry::with_system_clock(config.health.policy()));

    for provider in &config.providers {
        registry
            .register(provider.profile())
            .await
            .with_context(|| format!("Failed to register provider {}", provider.id()))?;
    }
    for binding in config.bindings()? {
        info!(
            "Role {} -> {}",
            binding.role,
            binding
                .providers
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        registry.bind(binding).await;
    }

    let mut gateway = AiGateway::new(registry, config.gateway_timeout());
    for provider in &config.providers {
        let api_key = std::env::var(&provider.api_key_env).unwrap_or_else(|_| {
            warn!(
                "{} is not set; provider {} will fail authentication",
                provider.api_key_env,
                provider.id()
            );
            String::new()
        });
        gateway = gateway.with_provider(Arc::new(OpenAiProvider::new(
            provider.id(),
            provider.base_url.clone(),
            api_key,
        )));
    }
    for (role, profile) in config.role_profiles()? {
        gateway = gateway.with_role_profile(role, profile);
    }

    Ok(gateway)
}
