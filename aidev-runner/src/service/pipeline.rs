//! Resolution pipeline
//!
//! Drives one `PipelineRun` through
//! `queued → planning → coding → reviewing → testing → committing → closed`.
//! Every state's entry action is re-entrant: a run reloaded from its last
//! checkpoint re-enters its state and skips any side effect the checkpoint
//! already records.

use aidev_core::domain::audit::{AuditEvent, AuditKind};
use aidev_core::domain::patch::{GeneratedBy, PatchCandidate, Verdict};
use aidev_core::domain::provider::Role;
use aidev_core::domain::run::{BlockReason, PipelineRun, RetryBudgets, RetryScope, RunState};
use aidev_gateway::{AiGateway, GatewayError, GatewayResponse, InvokeRequest};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::ContextBuilder;
use super::parse::parse_files;
use super::prompts;
use super::review::SafetyReviewer;
use crate::config::ProjectConfig;
use crate::repository::{
    AuditLog, CheckpointStore, CollabResult, CollaboratorError, IssueSource, SandboxRuntime,
    SourceControl,
};

/// External collaborators the pipeline drives
#[derive(Clone)]
pub struct Collaborators {
    pub issues: Arc<dyn IssueSource>,
    pub scm: Arc<dyn SourceControl>,
    pub sandbox: Arc<dyn SandboxRuntime>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub audit: Arc<dyn AuditLog>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Configured budgets, used to size retry backoff
    pub budgets: RetryBudgets,
    pub collaborator_timeout: Duration,
    /// First retry delay; doubles per retry within a scope
    pub retry_backoff: Duration,
    pub ai_review: bool,
    /// Runs allowed in `coding` or `testing` at the same time
    pub sandbox_slots: usize,
}

/// Told about every persisted checkpoint
#[async_trait]
pub trait RunObserver: Send + Sync {
    async fn checkpointed(&self, run: &PipelineRun);
}

/// Why a step did not complete normally
#[derive(Debug)]
enum StepError {
    /// Cancellation was observed at a suspension point
    Cancelled,
    /// A budget was spent; re-enter the current state
    Retry,
    Block(BlockReason),
}

fn collaborator_block(message: impl Into<String>) -> StepError {
    StepError::Block(BlockReason::Collaborator {
        message: message.into(),
    })
}

/// Runs `fut` unless the run is cancelled first
async fn guarded<T>(cancel: &CancellationToken, fut: impl Future<Output = T>) -> Result<T, StepError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StepError::Cancelled),
        out = fut => Ok(out),
    }
}

pub struct Pipeline {
    gateway: Arc<AiGateway>,
    reviewer: SafetyReviewer,
    context: ContextBuilder,
    deps: Collaborators,
    projects: HashMap<String, ProjectConfig>,
    /// One lock per project; held by the run using its working copy
    checkouts: HashMap<String, Arc<Mutex<()>>>,
    sandbox_slots: Semaphore,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        gateway: Arc<AiGateway>,
        deps: Collaborators,
        projects: Vec<ProjectConfig>,
        settings: PipelineSettings,
    ) -> Self {
        let checkouts = projects
            .iter()
            .map(|p| (p.name.clone(), Arc::new(Mutex::new(()))))
            .collect();
        Self {
            gateway,
            reviewer: SafetyReviewer::new(),
            context: ContextBuilder::default(),
            deps,
            projects: projects.into_iter().map(|p| (p.name.clone(), p)).collect(),
            checkouts,
            sandbox_slots: Semaphore::new(settings.sandbox_slots),
            settings,
        }
    }

    pub fn gateway(&self) -> &Arc<AiGateway> {
        &self.gateway
    }

    pub fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.deps.audit
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.deps.checkpoints
    }

    /// Advances `run` until it is closed or blocked, or cancellation is seen
    ///
    /// Runs of one project are driven one at a time: the project's working
    /// copy stays locked from the first step to the last.
    pub async fn drive(
        &self,
        mut run: PipelineRun,
        cancel: CancellationToken,
        observer: &dyn RunObserver,
    ) -> PipelineRun {
        // Unknown projects are blocked by their first step. A cancelled wait falls
        // through to the cancellation check below.
        let _checkout = match self.checkouts.get(&run.issue.project) {
            Some(lock) => {
                debug!("Run {} waiting for the {} checkout", run.id, run.issue.project);
                guarded(&cancel, lock.clone().lock_owned()).await.ok()
            }
            None => None,
        };
        info!("Driving run {} for {} from {}", run.id, run.issue, run.state);

        while !run.is_terminal() {
            let step = if cancel.is_cancelled() {
                Err(StepError::Cancelled)
            } else {
                match run.state {
                    RunState::Queued => self.admit(&mut run, &cancel, observer).await,
                    RunState::Planning => self.plan(&mut run, &cancel, observer).await,
                    RunState::Coding => {
                        self.in_sandbox_slot(&cancel, self.code(&mut run, &cancel, observer))
                            .await
                    }
                    RunState::Reviewing => self.review(&mut run, &cancel, observer).await,
                    RunState::Testing => {
                        self.in_sandbox_slot(&cancel, self.test(&mut run, &cancel, observer))
                            .await
                    }
                    RunState::Committing => self.commit(&mut run, &cancel, observer).await,
                    RunState::Closed | RunState::Blocked => break,
                }
            };

            match step {
                Ok(()) | Err(StepError::Retry) => {}
                Err(StepError::Cancelled) => {
                    info!("Run {} cancelled at {}", run.id, run.state);
                    self.block(&mut run, BlockReason::Cancelled, observer).await;
                }
                Err(StepError::Block(reason)) => {
                    self.block(&mut run, reason, observer).await;
                }
            }
        }

        if run.state == RunState::Closed {
            if let Err(e) = self.deps.checkpoints.archive(run.id).await {
                warn!("Failed to archive closed run {}: {}", run.id, e);
            }
            info!("Run {} closed {}", run.id, run.issue);
        }
        run
    }

    /// Moves a non-terminal run to `blocked`, persists it and tells the tracker
    pub async fn block(&self, run: &mut PipelineRun, reason: BlockReason, observer: &dyn RunObserver) {
        let from = run.state;
        if let Err(e) = run.block(reason.clone()) {
            warn!("{}", e);
            return;
        }
        warn!("Run {} blocked at {}: {}", run.id, from, reason);

        if let Err(StepError::Block(inner)) = self.checkpoint(run, observer).await {
            warn!("Blocked run {} could not be persisted: {}", run.id, inner);
        }
        self.deps
            .audit
            .emit(AuditEvent::for_run(
                run.id,
                AuditKind::Transition {
                    from,
                    to: RunState::Blocked,
                    note: reason.to_string(),
                },
            ))
            .await;
        self.deps
            .audit
            .emit(AuditEvent::for_run(run.id, AuditKind::Blocked { reason: reason.clone() }))
            .await;

        let report = self.deps.issues.report_blocked(&run.issue, &reason);
        match tokio::time::timeout(self.settings.collaborator_timeout, report).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to report blocked run {} on {}: {}", run.id, run.issue, e),
            Err(_) => warn!("Timed out reporting blocked run {} on {}", run.id, run.issue),
        }
    }

    // ========================================================================
    // Bookkeeping
    // ========================================================================

    /// Runs `step` while holding one of the sandbox slots
    async fn in_sandbox_slot(
        &self,
        cancel: &CancellationToken,
        step: impl Future<Output = Result<(), StepError>>,
    ) -> Result<(), StepError> {
        let _slot = guarded(cancel, self.sandbox_slots.acquire())
            .await?
            .map_err(|_| collaborator_block("sandbox slots closed"))?;
        step.await
    }

    /// Persists the run; failure to persist stops the run before any further
    /// side effect
    async fn checkpoint(&self, run: &mut PipelineRun, observer: &dyn RunObserver) -> Result<(), StepError> {
        run.checkpoint_seq += 1;
        let saved = tokio::time::timeout(
            self.settings.collaborator_timeout,
            self.deps.checkpoints.save(run),
        )
        .await
        .unwrap_or(Err(CollaboratorError::Timeout(self.settings.collaborator_timeout)));

        if let Err(e) = saved {
            self.deps
                .audit
                .emit(AuditEvent::for_run(
                    run.id,
                    AuditKind::CheckpointFailed {
                        state: run.state,
                        message: e.to_string(),
                    },
                ))
                .await;
            return Err(collaborator_block(format!("checkpoint failed: {}", e)));
        }

        observer.checkpointed(run).await;
        Ok(())
    }

    /// Advances, checkpoints, then records the transition
    async fn move_to(
        &self,
        run: &mut PipelineRun,
        to: RunState,
        note: String,
        observer: &dyn RunObserver,
    ) -> Result<(), StepError> {
        let from = run.state;
        run.advance(to, note.clone())
            .map_err(|e| collaborator_block(e.to_string()))?;
        self.checkpoint(run, observer).await?;

        info!("Run {} {} -> {} ({})", run.id, from, to, note);
        self.deps
            .audit
            .emit(AuditEvent::for_run(run.id, AuditKind::Transition { from, to, note }))
            .await;
        Ok(())
    }

    /// Takes one retry from `scope` and re-enters the state, or blocks
    async fn spend(
        &self,
        run: &mut PipelineRun,
        scope: RetryScope,
        detail: String,
        observer: &dyn RunObserver,
    ) -> StepError {
        if !run.retries.consume(scope) {
            return StepError::Block(BlockReason::RetryBudgetExhausted { scope, detail });
        }
        info!(
            "Run {} retrying {} ({} left): {}",
            run.id,
            scope,
            run.retries.remaining(scope),
            detail
        );
        self.deps
            .audit
            .emit(AuditEvent::for_run(
                run.id,
                AuditKind::CollaboratorRetry {
                    state: run.state,
                    message: detail,
                },
            ))
            .await;
        match self.checkpoint(run, observer).await {
            Ok(()) => StepError::Retry,
            Err(e) => e,
        }
    }

    /// Exponential delay before retry number `used` of `scope`
    fn backoff(&self, run: &PipelineRun, scope: RetryScope) -> Duration {
        let used = self
            .settings
            .budgets
            .remaining(scope)
            .saturating_sub(run.retries.remaining(scope))
            .max(1);
        self.settings.retry_backoff * 2u32.pow((used - 1).min(5))
    }

    /// Transient errors spend the scope's budget after a backoff; anything
    /// else blocks
    async fn retry_or_block(
        &self,
        run: &mut PipelineRun,
        scope: RetryScope,
        err: CollaboratorError,
        cancel: &CancellationToken,
        observer: &dyn RunObserver,
    ) -> StepError {
        if !err.is_transient() {
            return collaborator_block(err.to_string());
        }
        match self.spend(run, scope, err.to_string(), observer).await {
            StepError::Retry => {}
            other => return other,
        }
        let delay = self.backoff(run, scope);
        debug!("Run {} backing off {:?}", run.id, delay);
        match guarded(cancel, tokio::time::sleep(delay)).await {
            Ok(()) => StepError::Retry,
            Err(e) => e,
        }
    }

    /// Calls a collaborator under the per-call timeout and cancellation
    async fn collab<T>(
        &self,
        cancel: &CancellationToken,
        fut: impl Future<Output = CollabResult<T>>,
    ) -> Result<CollabResult<T>, StepError> {
        let timeout = self.settings.collaborator_timeout;
        let out = guarded(cancel, tokio::time::timeout(timeout, fut)).await?;
        Ok(out.unwrap_or(Err(CollaboratorError::Timeout(timeout))))
    }

    /// Gateway call with every attempt written to the audit log
    ///
    /// `Ok(None)` means every provider for the role failed.
    async fn invoke(
        &self,
        run: &PipelineRun,
        role: Role,
        request: &InvokeRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<GatewayResponse>, StepError> {
        let result = guarded(cancel, self.gateway.invoke(role, request)).await?;
        let (attempts, response) = match result {
            Ok(response) => (response.attempts.clone(), Some(response)),
            Err(GatewayError::AllProvidersFailed { attempts, .. }) => (attempts, None),
        };

        for attempt in &attempts {
            self.deps
                .audit
                .emit(AuditEvent::for_run(
                    run.id,
                    AuditKind::GatewayCall {
                        role,
                        provider: attempt.provider.clone(),
                        outcome: attempt.outcome.clone(),
                    },
                ))
                .await;
        }
        if response.is_none() {
            warn!("Run {}: no provider could serve role {}", run.id, role);
            self.deps
                .audit
                .emit(AuditEvent::for_run(
                    run.id,
                    AuditKind::GatewayExhausted {
                        role,
                        attempts: attempts.len(),
                    },
                ))
                .await;
        }
        Ok(response)
    }

    fn project(&self, run: &PipelineRun) -> Result<&ProjectConfig, StepError> {
        self.projects
            .get(&run.issue.project)
            .ok_or_else(|| collaborator_block(format!("unknown project '{}'", run.issue.project)))
    }

    /// Resets the checkout and builds the context package for AI calls
    async fn fresh_context(
        &self,
        run: &mut PipelineRun,
        project: &ProjectConfig,
        scope: RetryScope,
        cancel: &CancellationToken,
        observer: &dyn RunObserver,
    ) -> Result<String, StepError> {
        if let Err(e) = self.collab(cancel, self.deps.scm.prepare(project)).await? {
            return Err(self.retry_or_block(run, scope, e, cancel, observer).await);
        }

        let builder = self.context.clone();
        let root = project.path.clone();
        let issue = run.issue.clone();
        tokio::task::spawn_blocking(move || builder.build(&root, &issue))
            .await
            .map_err(|e| collaborator_block(format!("context build failed: {}", e)))
    }

    // ========================================================================
    // States
    // ========================================================================

    async fn admit(
        &self,
        run: &mut PipelineRun,
        cancel: &CancellationToken,
        observer: &dyn RunObserver,
    ) -> Result<(), StepError> {
        self.move_to(run, RunState::Planning, "admitted".to_string(), observer)
            .await?;

        if let Err(e) = self
            .collab(cancel, self.deps.issues.mark_in_progress(&run.issue))
            .await?
        {
            warn!("Failed to mark {} in progress: {}", run.issue, e);
        }
        Ok(())
    }

    async fn plan(
        &self,
        run: &mut PipelineRun,
        cancel: &CancellationToken,
        observer: &dyn RunObserver,
    ) -> Result<(), StepError> {
        let project = self.project(run)?.clone();
        let context = self
            .fresh_context(run, &project, RetryScope::Planning, cancel, observer)
            .await?;
        let request = InvokeRequest::new(prompts::plan_task(&run.issue, &project)).with_context(context);

        let mut response = self.invoke(run, Role::Planner, &request, cancel).await?;
        if response.is_none() {
            info!("Run {}: planner unavailable, asking architect", run.id);
            response = self.invoke(run, Role::Architect, &request, cancel).await?;
        }
        let Some(response) = response else {
            return Err(StepError::Block(BlockReason::ProvidersExhausted {
                role: Role::Planner,
            }));
        };

        run.plan = Some(response.text);
        self.move_to(
            run,
            RunState::Coding,
            format!("plan by {} ({})", response.provider, response.role),
            observer,
        )
        .await
    }

    async fn code(
        &self,
        run: &mut PipelineRun,
        cancel: &CancellationToken,
        observer: &dyn RunObserver,
    ) -> Result<(), StepError> {
        let project = self.project(run)?.clone();
        let Some(plan) = run.plan.clone() else {
            return Err(collaborator_block("coding without a plan"));
        };

        let context = self
            .fresh_context(run, &project, RetryScope::Coding, cancel, observer)
            .await?;
        let attempt = run.candidates.len() as u32 + 1;
        let task = prompts::code_task(&run.issue, &project, &plan, run.feedback.as_deref(), attempt);
        let request = InvokeRequest::new(task).with_context(context);

        let Some(response) = self.invoke(run, Role::Coder, &request, cancel).await? else {
            return Err(StepError::Block(BlockReason::ProvidersExhausted { role: Role::Coder }));
        };

        let changes = match parse_files(&response.text) {
            Ok(changes) => changes,
            Err(e) => {
                warn!("Run {}: unusable coder output from {}: {}", run.id, response.provider, e);
                let detail = format!("coder output from {}: {}", response.provider, e);
                return Err(self.spend(run, RetryScope::Coding, detail, observer).await);
            }
        };

        let candidate = PatchCandidate::new(
            attempt,
            changes,
            plan,
            GeneratedBy {
                role: Role::Coder,
                provider: response.provider.clone(),
            },
        );
        let note = format!(
            "candidate {} ({} files) from {}",
            candidate.id,
            candidate.changes.len(),
            response.provider
        );
        run.push_candidate(candidate);
        run.feedback = None;
        self.move_to(run, RunState::Reviewing, note, observer).await
    }

    async fn review(
        &self,
        run: &mut PipelineRun,
        cancel: &CancellationToken,
        observer: &dyn RunObserver,
    ) -> Result<(), StepError> {
        let project = self.project(run)?.clone();
        let Some(candidate) = run.active_candidate().cloned() else {
            return Err(collaborator_block("reviewing without a candidate"));
        };

        match candidate.verdict() {
            Verdict::Pending => {
                let target = project.language_target().ok().flatten();
                let mut verdict = self.reviewer.review(&candidate, target.as_ref());

                if verdict.verdict == Verdict::Approved && self.settings.ai_review {
                    let request = SafetyReviewer::advisory_request(&candidate, &run.issue);
                    match self.invoke(run, Role::Reviewer, &request, cancel).await? {
                        Some(advice) => SafetyReviewer::attach_advice(&mut verdict, &advice.text),
                        None => info!("Run {}: advisory review unavailable, continuing", run.id),
                    }
                }

                let event = AuditKind::ReviewVerdict {
                    candidate: candidate.id,
                    verdict: verdict.verdict,
                    categories: verdict.categories.clone(),
                    rationale: verdict.rationale.clone(),
                };
                if let Some(active) = run.active_candidate_mut() {
                    active
                        .attach_verdict(verdict)
                        .map_err(|e| collaborator_block(e.to_string()))?;
                }
                self.checkpoint(run, observer).await?;
                self.deps.audit.emit(AuditEvent::for_run(run.id, event)).await;
                Ok(())
            }
            Verdict::Approved | Verdict::Override => {
                let note = match candidate.verdict() {
                    Verdict::Override => format!(
                        "candidate {} overridden by {}",
                        candidate.id,
                        candidate.review.overridden_by.as_deref().unwrap_or("operator")
                    ),
                    _ => format!("candidate {} approved", candidate.id),
                };
                self.move_to(run, RunState::Testing, note, observer).await
            }
            Verdict::Rejected => {
                if !run.retries.consume(RetryScope::Regeneration) {
                    return Err(StepError::Block(BlockReason::ReviewRejected {
                        candidate: candidate.id,
                    }));
                }
                run.feedback = Some(format!(
                    "Safety review rejected the previous change:\n{}",
                    candidate.review.rationale
                ));
                let note = format!(
                    "regenerate after rejection ({} left)",
                    run.retries.remaining(RetryScope::Regeneration)
                );
                self.move_to(run, RunState::Coding, note, observer).await
            }
        }
    }

    async fn test(
        &self,
        run: &mut PipelineRun,
        cancel: &CancellationToken,
        observer: &dyn RunObserver,
    ) -> Result<(), StepError> {
        let project = self.project(run)?.clone();
        let Some(candidate) = run.active_candidate().cloned() else {
            return Err(collaborator_block("testing without a candidate"));
        };

        if let Err(e) = self.collab(cancel, self.deps.scm.prepare(&project)).await? {
            return Err(self.retry_or_block(run, RetryScope::Testing, e, cancel, observer).await);
        }
        if let Err(e) = self
            .collab(cancel, self.deps.scm.write_changes(&project, &candidate.changes))
            .await?
        {
            return Err(self.retry_or_block(run, RetryScope::Testing, e, cancel, observer).await);
        }
        let report = match self
            .collab(cancel, self.deps.sandbox.run_tests(&project, run.id))
            .await?
        {
            Ok(report) => report,
            Err(e) => {
                return Err(self.retry_or_block(run, RetryScope::Testing, e, cancel, observer).await);
            }
        };

        let passed = report.passed;
        let exit_code = report.exit_code;
        run.last_test = Some(report.clone());

        if passed {
            return self
                .move_to(run, RunState::Committing, "tests passed".to_string(), observer)
                .await;
        }

        if !run.retries.consume(RetryScope::Testing) {
            return Err(StepError::Block(BlockReason::RetryBudgetExhausted {
                scope: RetryScope::Testing,
                detail: format!("tests failed with exit code {}", exit_code),
            }));
        }
        run.feedback = Some(format!(
            "The tests failed with exit code {}:\n{}",
            exit_code, report.output
        ));
        self.move_to(
            run,
            RunState::Coding,
            format!("tests failed with exit code {}", exit_code),
            observer,
        )
        .await
    }

    /// Apply, push, close; each sub-step is recorded before the next starts
    async fn commit(
        &self,
        run: &mut PipelineRun,
        cancel: &CancellationToken,
        observer: &dyn RunObserver,
    ) -> Result<(), StepError> {
        let project = self.project(run)?.clone();
        let Some(candidate) = run.active_candidate().cloned() else {
            return Err(collaborator_block("committing without a candidate"));
        };

        if run.commit.commit.is_none() {
            let message = prompts::commit_message(&run.issue);
            match self
                .collab(cancel, self.deps.scm.apply_patch(&project, &candidate, &message))
                .await?
            {
                Ok(commit) => {
                    info!("Run {} committed {}", run.id, commit.sha);
                    run.commit.commit = Some(commit);
                    self.checkpoint(run, observer).await?;
                }
                Err(e) => {
                    return Err(self
                        .retry_or_block(run, RetryScope::Committing, e, cancel, observer)
                        .await);
                }
            }
        }

        if !run.commit.pushed {
            match self.collab(cancel, self.deps.scm.push(&project)).await? {
                Ok(()) => {
                    run.commit.pushed = true;
                    self.checkpoint(run, observer).await?;
                }
                Err(CollaboratorError::RebaseRequired(detail)) => {
                    match self.spend(run, RetryScope::Committing, detail, observer).await {
                        StepError::Retry => {}
                        other => return Err(other),
                    }
                    guarded(cancel, tokio::time::sleep(self.backoff(run, RetryScope::Committing)))
                        .await?;
                    match self.collab(cancel, self.deps.scm.rebase(&project)).await? {
                        Ok(commit) => {
                            info!("Run {} rebased to {}", run.id, commit.sha);
                            run.commit.commit = Some(commit);
                            self.checkpoint(run, observer).await?;
                            return Err(StepError::Retry);
                        }
                        Err(e) => {
                            return Err(self
                                .retry_or_block(run, RetryScope::Committing, e, cancel, observer)
                                .await);
                        }
                    }
                }
                Err(e) => {
                    return Err(self
                        .retry_or_block(run, RetryScope::Committing, e, cancel, observer)
                        .await);
                }
            }
        }

        let Some(commit) = run.commit.commit.clone() else {
            return Err(collaborator_block("pushed without a commit"));
        };

        if !run.commit.issue_closed {
            match self
                .collab(cancel, self.deps.issues.close_issue(&run.issue, &commit))
                .await?
            {
                Ok(()) => {
                    run.commit.issue_closed = true;
                    self.checkpoint(run, observer).await?;
                }
                Err(e) => {
                    return Err(self
                        .retry_or_block(run, RetryScope::Committing, e, cancel, observer)
                        .await);
                }
            }
        }

        self.move_to(
            run,
            RunState::Closed,
            format!("{} pushed to {}", commit.sha, commit.branch),
            observer,
        )
        .await
    }
}
