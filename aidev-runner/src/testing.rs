//! In-memory collaborators and a scripted gateway for pipeline tests

use aidev_core::domain::audit::{AuditEvent, AuditKind};
use aidev_core::domain::issue::{IssueKey, IssueRef};
use aidev_core::domain::patch::{FileChange, GeneratedBy, PatchCandidate};
use aidev_core::domain::provider::{ProviderId, ProviderProfile, QuotaCeiling, Role, RoleBinding};
use aidev_core::domain::run::{
    BlockReason, CommitRef, PipelineRun, RetryBudgets, RunState, TestReport,
};
use aidev_gateway::{
    AiGateway, Chunk, ChunkStream, CompletionProvider, CompletionRequest, HealthPolicy,
    ManualClock, ProviderError, ProviderRegistry,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::ProjectConfig;
use crate::repository::{
    AuditLog, CheckpointStore, CollabResult, CollaboratorError, IssueSource, SandboxRuntime,
    SourceControl,
};
use crate::scheduler::Scheduler;
use crate::service::{Collaborators, Pipeline, PipelineSettings};

pub const CLEAN_PATCH: &str = "=== FILE: src/login.php ===\n<?php\n$stmt = $db->prepare('SELECT * FROM users WHERE id = ?');\n=== END FILE ===";
pub const DROP_PATCH: &str = "=== FILE: src/migrate.php ===\n<?php\n$db->query('DROP TABLE users');\n=== END FILE ===";

/// Pops scripted entries front to back; the last one repeats
fn next<T: Clone>(script: &Mutex<Vec<T>>) -> Option<T> {
    let mut script = script.lock().unwrap();
    match script.len() {
        0 => None,
        1 => Some(script[0].clone()),
        _ => Some(script.remove(0)),
    }
}

// ============================================================================
// Gateway
// ============================================================================

#[derive(Clone)]
pub enum Reply {
    Text(&'static str),
    Fail(ProviderError),
}

pub struct ScriptedProvider {
    id: ProviderId,
    script: Mutex<Vec<Reply>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(name: &str, script: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            id: ProviderId::new(name, "model"),
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    async fn stream(&self, _request: &CompletionRequest) -> Result<ChunkStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match next(&self.script) {
            Some(Reply::Text(text)) => {
                let items = vec![Ok(Chunk::Text(text.to_string()))];
                Ok(Box::pin(futures::stream::iter(items)))
            }
            Some(Reply::Fail(err)) => Err(err),
            None => Err(ProviderError::Transport("no script".to_string())),
        }
    }
}

/// One scripted provider per role
pub struct Providers {
    pub planner: Arc<ScriptedProvider>,
    pub architect: Arc<ScriptedProvider>,
    pub coder: Arc<ScriptedProvider>,
    pub reviewer: Arc<ScriptedProvider>,
}

impl Providers {
    pub fn new(coder: Vec<Reply>) -> Self {
        Self {
            planner: ScriptedProvider::new("planner", vec![Reply::Text("1. Fix the query")]),
            architect: ScriptedProvider::new("architect", vec![Reply::Text("1. Redesign")]),
            coder: ScriptedProvider::new("coder", coder),
            reviewer: ScriptedProvider::new("reviewer", vec![Reply::Text("Looks fine")]),
        }
    }

    fn by_role(&self) -> [(Role, &Arc<ScriptedProvider>); 4] {
        [
            (Role::Planner, &self.planner),
            (Role::Architect, &self.architect),
            (Role::Coder, &self.coder),
            (Role::Reviewer, &self.reviewer),
        ]
    }

    async fn gateway(&self) -> AiGateway {
        let registry = Arc::new(ProviderRegistry::new(
            HealthPolicy::default(),
            Arc::new(ManualClock::default()),
        ));
        let mut gateway_providers = Vec::new();
        for (role, provider) in self.by_role() {
            registry
                .register(ProviderProfile::new(
                    provider.id.clone(),
                    vec![role],
                    QuotaCeiling::default(),
                ))
                .await
                .unwrap();
            registry
                .bind(RoleBinding {
                    role,
                    providers: vec![provider.id.clone()],
                })
                .await;
            gateway_providers.push(provider.clone());
        }

        let mut gateway = AiGateway::new(registry, Duration::from_secs(5));
        for provider in gateway_providers {
            gateway = gateway.with_provider(provider);
        }
        gateway
    }
}

// ============================================================================
// Collaborators
// ============================================================================

#[derive(Default)]
pub struct FakeIssues {
    pub open: Mutex<Vec<IssueRef>>,
    pub in_progress: Mutex<Vec<IssueKey>>,
    pub closed: Mutex<Vec<(IssueKey, String)>>,
    pub blocked: Mutex<Vec<(IssueKey, BlockReason)>>,
    pub close_script: Mutex<Vec<CollabResult<()>>>,
}

#[async_trait]
impl IssueSource for FakeIssues {
    async fn poll_new_issues(&self, project: &ProjectConfig, _label: &str) -> CollabResult<Vec<IssueRef>> {
        Ok(self
            .open
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.project == project.name)
            .cloned()
            .collect())
    }

    async fn mark_in_progress(&self, issue: &IssueRef) -> CollabResult<()> {
        self.in_progress.lock().unwrap().push(issue.key());
        Ok(())
    }

    async fn close_issue(&self, issue: &IssueRef, commit: &CommitRef) -> CollabResult<()> {
        next(&self.close_script).unwrap_or(Ok(()))?;
        self.closed
            .lock()
            .unwrap()
            .push((issue.key(), commit.sha.clone()));
        Ok(())
    }

    async fn report_blocked(&self, issue: &IssueRef, reason: &BlockReason) -> CollabResult<()> {
        self.blocked
            .lock()
            .unwrap()
            .push((issue.key(), reason.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeScm {
    /// Every call in order, as `project:operation`
    pub events: Mutex<Vec<String>>,
    pub prepares: AtomicUsize,
    pub written: Mutex<Vec<Vec<FileChange>>>,
    pub commits: AtomicUsize,
    pub pushes: AtomicUsize,
    pub rebases: AtomicUsize,
    pub push_script: Mutex<Vec<CollabResult<()>>>,
}

impl FakeScm {
    fn log(&self, project: &ProjectConfig, operation: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{}:{}", project.name, operation));
    }

    /// Recorded operations on `project`, in order
    pub fn events_for(&self, project: &str) -> Vec<String> {
        let prefix = format!("{}:", project);
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl SourceControl for FakeScm {
    async fn prepare(&self, project: &ProjectConfig) -> CollabResult<()> {
        self.log(project, "prepare");
        self.prepares.fetch_add(1, Ordering::SeqCst);
        // Lets another task run between checkout operations
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn write_changes(&self, project: &ProjectConfig, changes: &[FileChange]) -> CollabResult<()> {
        self.log(project, "write");
        self.written.lock().unwrap().push(changes.to_vec());
        Ok(())
    }

    async fn apply_patch(
        &self,
        project: &ProjectConfig,
        _candidate: &PatchCandidate,
        _message: &str,
    ) -> CollabResult<CommitRef> {
        self.log(project, "commit");
        let n = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CommitRef {
            project: project.name.clone(),
            sha: format!("commit-{}", n),
            branch: project.branch.clone(),
        })
    }

    async fn push(&self, project: &ProjectConfig) -> CollabResult<()> {
        self.log(project, "push");
        self.pushes.fetch_add(1, Ordering::SeqCst);
        next(&self.push_script).unwrap_or(Ok(()))
    }

    async fn rebase(&self, project: &ProjectConfig) -> CollabResult<CommitRef> {
        self.log(project, "rebase");
        let n = self.rebases.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CommitRef {
            project: project.name.clone(),
            sha: format!("rebased-{}", n),
            branch: project.branch.clone(),
        })
    }
}

pub fn passed() -> TestReport {
    TestReport {
        passed: true,
        exit_code: 0,
        output: "OK (3 tests)".to_string(),
    }
}

pub fn failed() -> TestReport {
    TestReport {
        passed: false,
        exit_code: 1,
        output: "FAILURES! Tests: 3, Failures: 1".to_string(),
    }
}

/// Sandbox with scripted reports and an optional gate holding every test run
pub struct FakeSandbox {
    pub script: Mutex<Vec<CollabResult<TestReport>>>,
    pub calls: AtomicUsize,
    pub running: AtomicUsize,
    pub max_running: AtomicUsize,
    /// When set, each run waits for one permit
    pub gate: Option<Semaphore>,
}

impl Default for FakeSandbox {
    fn default() -> Self {
        Self {
            script: Mutex::new(vec![Ok(passed())]),
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            gate: None,
        }
    }
}

#[async_trait]
impl SandboxRuntime for FakeSandbox {
    async fn run_tests(&self, _project: &ProjectConfig, _run_id: Uuid) -> CollabResult<TestReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
        next(&self.script).unwrap_or_else(|| Ok(passed()))
    }
}

#[derive(Default)]
pub struct MemoryCheckpoints {
    pub runs: Mutex<HashMap<Uuid, PipelineRun>>,
    pub archived: Mutex<Vec<Uuid>>,
    pub saves: AtomicUsize,
    pub fail_saves: AtomicBool,
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoints {
    async fn save(&self, run: &PipelineRun) -> CollabResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Persistent("disk full".to_string()));
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.runs.lock().unwrap().insert(run.id, run.clone());
        Ok(())
    }

    async fn load(&self, id: Uuid) -> CollabResult<Option<PipelineRun>> {
        Ok(self.runs.lock().unwrap().get(&id).cloned())
    }

    async fn load_all(&self) -> CollabResult<Vec<PipelineRun>> {
        let mut runs: Vec<_> = self.runs.lock().unwrap().values().cloned().collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn archive(&self, id: Uuid) -> CollabResult<()> {
        if self.runs.lock().unwrap().remove(&id).is_some() {
            self.archived.lock().unwrap().push(id);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAudit {
    pub events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAudit {
    pub fn kinds(&self) -> Vec<AuditKind> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.kind.clone())
            .collect()
    }
}

#[async_trait]
impl AuditLog for MemoryAudit {
    async fn record(&self, event: &AuditEvent) -> CollabResult<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn issue(number: u64) -> IssueRef {
    issue_in("shop", number)
}

/// An issue of one of the harness projects, `shop` or `depot`
pub fn issue_in(project: &str, number: u64) -> IssueRef {
    IssueRef {
        project: project.to_string(),
        repo: format!("acme/{}", project),
        number,
        title: "Login query is broken".to_string(),
        body: "Users cannot log in".to_string(),
        labels: vec!["aidev".to_string()],
        url: None,
    }
}

pub fn project(path: PathBuf) -> ProjectConfig {
    project_named("shop", path)
}

pub fn project_named(name: &str, path: PathBuf) -> ProjectConfig {
    ProjectConfig {
        name: name.to_string(),
        repo: format!("acme/{}", name),
        path,
        branch: "main".to_string(),
        remote: "origin".to_string(),
        test_image: Some("php:8.2-cli".to_string()),
        test_command: Some("vendor/bin/phpunit".to_string()),
        cpu_limit: None,
        memory_limit: None,
        language: None,
        language_version: None,
    }
}

/// A run holding one unreviewed candidate built from `patch`, at `reviewing`
pub fn run_at_reviewing(number: u64, budgets: RetryBudgets, patch: &str) -> PipelineRun {
    let mut run = PipelineRun::new(issue(number), budgets);
    run.advance(RunState::Planning, "admitted").unwrap();
    run.plan = Some("1. Fix the query".to_string());
    run.advance(RunState::Coding, "planned").unwrap();
    run.push_candidate(PatchCandidate::new(
        1,
        crate::service::parse::parse_files(patch).unwrap(),
        "1. Fix the query".to_string(),
        GeneratedBy {
            role: Role::Coder,
            provider: ProviderId::new("coder", "model"),
        },
    ));
    run.advance(RunState::Reviewing, "generated").unwrap();
    run
}

pub struct Harness {
    pub providers: Providers,
    pub issues: Arc<FakeIssues>,
    pub scm: Arc<FakeScm>,
    pub sandbox: Arc<FakeSandbox>,
    pub checkpoints: Arc<MemoryCheckpoints>,
    pub audit: Arc<MemoryAudit>,
    pub pipeline: Arc<Pipeline>,
    pub budgets: RetryBudgets,
    _checkout: TempDir,
}

pub struct HarnessBuilder {
    providers: Providers,
    sandbox: FakeSandbox,
    checkpoints: Arc<MemoryCheckpoints>,
    budgets: RetryBudgets,
    sandbox_slots: usize,
}

impl HarnessBuilder {
    pub fn sandbox_slots(mut self, slots: usize) -> Self {
        self.sandbox_slots = slots;
        self
    }

    pub fn sandbox(mut self, sandbox: FakeSandbox) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn checkpoints(mut self, checkpoints: Arc<MemoryCheckpoints>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub fn budgets(mut self, budgets: RetryBudgets) -> Self {
        self.budgets = budgets;
        self
    }

    pub fn providers(mut self, providers: Providers) -> Self {
        self.providers = providers;
        self
    }

    pub async fn build(self) -> Harness {
        let checkout = TempDir::new().unwrap();
        let issues = Arc::new(FakeIssues::default());
        let scm = Arc::new(FakeScm::default());
        let sandbox = Arc::new(self.sandbox);
        let audit = Arc::new(MemoryAudit::default());

        let deps = Collaborators {
            issues: issues.clone(),
            scm: scm.clone(),
            sandbox: sandbox.clone(),
            checkpoints: self.checkpoints.clone(),
            audit: audit.clone(),
        };
        let settings = PipelineSettings {
            budgets: self.budgets,
            collaborator_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(1),
            ai_review: false,
            sandbox_slots: self.sandbox_slots,
        };
        let gateway = Arc::new(self.providers.gateway().await);
        let projects = vec![
            project(checkout.path().to_path_buf()),
            project_named("depot", checkout.path().to_path_buf()),
        ];
        let pipeline = Arc::new(Pipeline::new(gateway, deps, projects, settings));

        Harness {
            providers: self.providers,
            issues,
            scm,
            sandbox,
            checkpoints: self.checkpoints,
            audit,
            pipeline,
            budgets: self.budgets,
            _checkout: checkout,
        }
    }
}

impl Harness {
    pub fn builder(coder: Vec<Reply>) -> HarnessBuilder {
        HarnessBuilder {
            providers: Providers::new(coder),
            sandbox: FakeSandbox::default(),
            checkpoints: Arc::new(MemoryCheckpoints::default()),
            budgets: RetryBudgets::default(),
            sandbox_slots: 4,
        }
    }

    pub async fn new(coder: Vec<Reply>) -> Self {
        Self::builder(coder).build().await
    }

    pub fn scheduler(&self, workers: usize) -> Arc<Scheduler> {
        Arc::new(Scheduler::new(self.pipeline.clone(), workers, self.budgets))
    }
}

/// Observer that ignores checkpoints
pub struct NoObserver;

#[async_trait]
impl crate::service::RunObserver for NoObserver {
    async fn checkpointed(&self, _run: &PipelineRun) {}
}

/// Polls `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
