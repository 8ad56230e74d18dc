//! Pipeline scheduler
//!
//! Owns the live run table. `enqueue` creates at most one run per issue,
//! `tick` hands waiting runs to workers while workers are free, and the
//! operator actions (cancel, override, dismiss) act on runs no worker is
//! driving.

pub mod poller;

use aidev_core::domain::audit::{AuditEvent, AuditKind};
use aidev_core::domain::issue::IssueRef;
use aidev_core::domain::patch::Verdict;
use aidev_core::domain::run::{BlockReason, PipelineRun, RetryBudgets, RunState};
use aidev_core::dto::run::RunSummary;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::repository::CollaboratorError;
use crate::service::{Pipeline, RunObserver};

pub use poller::{IssuePoller, run_tick_loop};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("run {0} not found")]
    NotFound(Uuid),

    #[error("{0}")]
    Conflict(String),

    #[error("checkpoint store failed: {0}")]
    Storage(#[from] CollaboratorError),
}

/// Result of `enqueue`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted(Uuid),
    /// The issue already has a live run
    AlreadyActive(Uuid),
}

/// What `cancel` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// A worker owns the run; it blocks at its next suspension point
    Signalled,
    /// The run was waiting and is now blocked
    Blocked,
}

struct RunEntry {
    run: PipelineRun,
    cancel: CancellationToken,
    /// A worker currently owns the run
    active: bool,
}

/// Live runs, keyed by id
///
/// Closed runs leave the table; blocked runs stay until dismissed.
#[derive(Default)]
pub struct RunTable {
    entries: Mutex<HashMap<Uuid, RunEntry>>,
}

impl RunTable {
    /// Waiting runs, highest priority first, then oldest
    ///
    /// Offers at most one run per project and none for a project that
    /// already has a driven run.
    async fn waiting(&self) -> Vec<Uuid> {
        let entries = self.entries.lock().await;
        let busy: HashSet<&str> = entries
            .values()
            .filter(|e| e.active)
            .map(|e| e.run.issue.project.as_str())
            .collect();
        let mut ready: Vec<_> = entries
            .values()
            .filter(|e| !e.active && !e.run.is_terminal())
            .filter(|e| !busy.contains(e.run.issue.project.as_str()))
            .map(|e| {
                let run = &e.run;
                (run.issue.priority(), run.created_at, run.id, run.issue.project.as_str())
            })
            .collect();
        ready.sort();

        let mut offered = HashSet::new();
        ready
            .into_iter()
            .filter(|(_, _, _, project)| offered.insert(*project))
            .map(|(_, _, id, _)| id)
            .collect()
    }

    /// Takes exclusive ownership of a waiting run
    async fn claim(&self, id: Uuid) -> Option<(PipelineRun, CancellationToken)> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(&id)?;
        if entry.active || entry.run.is_terminal() {
            return None;
        }
        entry.active = true;
        Some((entry.run.clone(), entry.cancel.clone()))
    }

    /// Releases ownership; closed runs leave the table
    async fn finish(&self, run: PipelineRun) {
        let mut entries = self.entries.lock().await;
        if run.state == RunState::Closed {
            entries.remove(&run.id);
            return;
        }
        if let Some(entry) = entries.get_mut(&run.id) {
            entry.active = false;
            entry.run = run;
        }
    }
}

#[async_trait]
impl RunObserver for RunTable {
    async fn checkpointed(&self, run: &PipelineRun) {
        if let Some(entry) = self.entries.lock().await.get_mut(&run.id) {
            entry.run = run.clone();
        }
    }
}

pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    table: Arc<RunTable>,
    /// One permit per run being driven
    workers: Arc<Semaphore>,
    budgets: RetryBudgets,
}

impl Scheduler {
    pub fn new(pipeline: Arc<Pipeline>, max_workers: usize, budgets: RetryBudgets) -> Self {
        Self {
            pipeline,
            table: Arc::new(RunTable::default()),
            workers: Arc::new(Semaphore::new(max_workers)),
            budgets,
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Loads every live checkpoint into the table
    ///
    /// Non-terminal runs are picked up by the next `tick` at their
    /// recorded state.
    pub async fn recover(&self) -> Result<usize, SchedulerError> {
        let runs = self.pipeline.checkpoints().load_all().await?;
        let mut entries = self.table.entries.lock().await;
        let mut resumable = 0;

        for run in runs {
            if entries.contains_key(&run.id) {
                continue;
            }
            if run.state == RunState::Closed {
                // Closed but not yet archived when the daemon stopped.
                if let Err(e) = self.pipeline.checkpoints().archive(run.id).await {
                    warn!("Failed to archive closed run {}: {}", run.id, e);
                }
                continue;
            }
            if !run.is_terminal() {
                resumable += 1;
            }
            info!("Recovered run {} for {} at {}", run.id, run.issue, run.state);
            entries.insert(
                run.id,
                RunEntry {
                    run,
                    cancel: CancellationToken::new(),
                    active: false,
                },
            );
        }

        info!("Recovered {} runs, {} resumable", entries.len(), resumable);
        Ok(resumable)
    }

    /// Creates a run for `issue` unless one is already live
    pub async fn enqueue(&self, issue: IssueRef) -> Result<EnqueueOutcome, SchedulerError> {
        let key = issue.key();
        let mut entries = self.table.entries.lock().await;

        if let Some(existing) = entries.values().find(|e| e.run.issue.key() == key) {
            debug!("{} already has run {}", key, existing.run.id);
            return Ok(EnqueueOutcome::AlreadyActive(existing.run.id));
        }

        let run = PipelineRun::new(issue, self.budgets);
        self.pipeline.checkpoints().save(&run).await?;

        let id = run.id;
        info!("Enqueued run {} for {}", id, key);
        entries.insert(
            id,
            RunEntry {
                run,
                cancel: CancellationToken::new(),
                active: false,
            },
        );
        drop(entries);

        self.pipeline
            .audit()
            .emit(AuditEvent::for_run(id, AuditKind::RunEnqueued { issue: key }))
            .await;
        Ok(EnqueueOutcome::Accepted(id))
    }

    /// Starts a worker for each waiting run while workers are free
    ///
    /// Returns how many runs were started.
    pub async fn tick(&self) -> usize {
        let mut started = 0;

        for id in self.table.waiting().await {
            let permit = match self.workers.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!("No free worker, remaining runs stay queued");
                    break;
                }
            };
            let Some((run, cancel)) = self.table.claim(id).await else {
                continue;
            };

            let pipeline = self.pipeline.clone();
            let table = self.table.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let run = pipeline.drive(run, cancel, table.as_ref()).await;
                table.finish(run).await;
            });
            started += 1;
        }

        if started > 0 {
            info!("Started {} runs", started);
        }
        started
    }

    /// Cancels a run; a driven run stops at its next suspension point
    pub async fn cancel(&self, id: Uuid, operator: Option<String>) -> Result<CancelOutcome, SchedulerError> {
        let (waiting_run, outcome) = {
            let mut entries = self.table.entries.lock().await;
            let entry = entries.get_mut(&id).ok_or(SchedulerError::NotFound(id))?;
            if entry.run.is_terminal() {
                return Err(SchedulerError::Conflict(format!(
                    "run {} is already {}",
                    id, entry.run.state
                )));
            }

            if entry.active {
                entry.cancel.cancel();
                (None, CancelOutcome::Signalled)
            } else {
                // Claim it so no worker starts it while it is being blocked.
                entry.active = true;
                (Some(entry.run.clone()), CancelOutcome::Blocked)
            }
        };

        info!("Run {} cancelled by {}", id, operator.as_deref().unwrap_or("operator"));
        self.pipeline
            .audit()
            .emit(AuditEvent::for_run(id, AuditKind::Cancelled { operator }))
            .await;

        if let Some(mut run) = waiting_run {
            self.pipeline
                .block(&mut run, BlockReason::Cancelled, self.table.as_ref())
                .await;
            self.table.finish(run).await;
        }
        Ok(outcome)
    }

    /// Supersedes the rejected verdict of a blocked run's active candidate
    /// and sends the run back to `reviewing`
    pub async fn override_run(
        &self,
        id: Uuid,
        operator: &str,
        reason: &str,
    ) -> Result<PipelineRun, SchedulerError> {
        let mut entries = self.table.entries.lock().await;
        let entry = entries.get_mut(&id).ok_or(SchedulerError::NotFound(id))?;

        if entry.active || entry.run.state != RunState::Blocked {
            return Err(SchedulerError::Conflict(format!(
                "run {} is {}; only blocked runs can be overridden",
                id, entry.run.state
            )));
        }

        let mut run = entry.run.clone();
        let candidate = run
            .active_candidate_mut()
            .ok_or_else(|| SchedulerError::Conflict(format!("run {} has no candidate", id)))?;
        if candidate.verdict() != Verdict::Rejected {
            return Err(SchedulerError::Conflict(format!(
                "active candidate of run {} is {}, not rejected",
                id,
                candidate.verdict()
            )));
        }
        candidate
            .apply_override(operator, reason)
            .map_err(|e| SchedulerError::Conflict(e.to_string()))?;
        let candidate_id = candidate.id;

        run.resume_after_override(operator)
            .map_err(|e| SchedulerError::Conflict(e.to_string()))?;
        run.checkpoint_seq += 1;
        self.pipeline.checkpoints().save(&run).await?;

        entry.run = run.clone();
        entry.cancel = CancellationToken::new();
        drop(entries);

        info!("Run {} candidate {} overridden by {}", id, candidate_id, operator);
        let audit = self.pipeline.audit();
        audit
            .emit(AuditEvent::for_run(
                id,
                AuditKind::Override {
                    candidate: candidate_id,
                    operator: operator.to_string(),
                    reason: reason.to_string(),
                },
            ))
            .await;
        if let Some(resumed) = run.history.last() {
            audit
                .emit(AuditEvent::for_run(
                    id,
                    AuditKind::Transition {
                        from: resumed.from,
                        to: resumed.to,
                        note: resumed.note.clone(),
                    },
                ))
                .await;
        }
        Ok(run)
    }

    /// Archives a blocked run and releases its issue
    pub async fn dismiss(&self, id: Uuid) -> Result<(), SchedulerError> {
        let mut entries = self.table.entries.lock().await;
        let entry = entries.get(&id).ok_or(SchedulerError::NotFound(id))?;
        if entry.active || entry.run.state != RunState::Blocked {
            return Err(SchedulerError::Conflict(format!(
                "run {} is {}; only blocked runs can be dismissed",
                id, entry.run.state
            )));
        }

        if let Err(e) = self.pipeline.checkpoints().archive(id).await {
            error!("Failed to archive run {}: {}", id, e);
            return Err(e.into());
        }
        entries.remove(&id);
        drop(entries);

        info!("Run {} dismissed", id);
        self.pipeline
            .audit()
            .emit(AuditEvent::for_run(id, AuditKind::Dismissed))
            .await;
        Ok(())
    }

    /// Every live run, least recently updated first
    pub async fn runs(&self) -> Vec<RunSummary> {
        let entries = self.table.entries.lock().await;
        let mut runs: Vec<_> = entries
            .values()
            .map(|e| RunSummary::from_run(&e.run, e.active))
            .collect();
        runs.sort_by_key(|r| r.updated_at);
        runs
    }

    pub async fn run(&self, id: Uuid) -> Option<PipelineRun> {
        self.table
            .entries
            .lock()
            .await
            .get(&id)
            .map(|e| e.run.clone())
    }

    /// Number of runs a worker currently owns
    pub async fn active_count(&self) -> usize {
        self.table
            .entries
            .lock()
            .await
            .values()
            .filter(|e| e.active)
            .count()
    }
}
