//! Issue poller and tick loop
//!
//! The poller asks each project's issue tracker for labelled issues and
//! enqueues them; the tick loop admits waiting runs into free worker slots.

use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{EnqueueOutcome, Scheduler};
use crate::config::ProjectConfig;
use crate::repository::IssueSource;

/// Periodically enqueues labelled issues
pub struct IssuePoller {
    scheduler: Arc<Scheduler>,
    issues: Arc<dyn IssueSource>,
    projects: Vec<ProjectConfig>,
    label: String,
    interval: Duration,
}

impl IssuePoller {
    pub fn new(
        scheduler: Arc<Scheduler>,
        issues: Arc<dyn IssueSource>,
        projects: Vec<ProjectConfig>,
        label: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            scheduler,
            issues,
            projects,
            label: label.into(),
            interval,
        }
    }

    /// Polls until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Starting issue poller (interval: {:?}, label: {}, projects: {})",
            self.interval,
            self.label,
            self.projects.len()
        );
        let mut interval = time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Issue poller stopped");
                    return;
                }
                _ = interval.tick() => {}
            }

            let accepted = self.poll_once().await;
            if accepted > 0 {
                info!("Enqueued {} new issue(s) this cycle", accepted);
            }
        }
    }

    /// One pass over every project; returns how many runs were created
    pub async fn poll_once(&self) -> usize {
        let mut accepted = 0;

        for project in &self.projects {
            debug!("Polling {} for '{}' issues", project.repo, self.label);
            let issues = match self.issues.poll_new_issues(project, &self.label).await {
                Ok(issues) => issues,
                Err(e) => {
                    warn!("Failed to poll issues for {}: {}", project.name, e);
                    continue;
                }
            };

            for issue in issues {
                match self.scheduler.enqueue(issue.clone()).await {
                    Ok(EnqueueOutcome::Accepted(id)) => {
                        info!("New issue {}: {} (run {})", issue, issue.title, id);
                        accepted += 1;
                    }
                    Ok(EnqueueOutcome::AlreadyActive(_)) => {}
                    Err(e) => error!("Failed to enqueue {}: {}", issue, e),
                }
            }
        }

        accepted
    }
}

/// Calls `tick` every `every` until `shutdown` fires
pub async fn run_tick_loop(scheduler: Arc<Scheduler>, every: Duration, shutdown: CancellationToken) {
    info!("Starting scheduler tick loop (interval: {:?})", every);
    let mut interval = time::interval(every);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Tick loop stopped");
                return;
            }
            _ = interval.tick() => {
                scheduler.tick().await;
            }
        }
    }
}
