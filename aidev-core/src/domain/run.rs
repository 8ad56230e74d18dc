//! Pipeline run domain types
//!
//! A `PipelineRun` is the persisted state machine driving one issue from
//! detection to closure. It is serialized whole as the run's checkpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::issue::IssueRef;
use crate::domain::patch::PatchCandidate;
use crate::domain::provider::Role;

/// Pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Planning,
    Coding,
    Reviewing,
    Testing,
    Committing,
    Closed,
    Blocked,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Closed | RunState::Blocked)
    }

    /// Whether the automatic state machine may move from `self` to `to`
    pub fn can_advance_to(&self, to: RunState) -> bool {
        use RunState::{Blocked, Closed, Coding, Committing, Planning, Queued, Reviewing, Testing};

        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, to),
            (_, Blocked)
                | (Queued, Planning)
                | (Planning, Coding)
                | (Coding, Reviewing)
                | (Reviewing, Testing)
                | (Reviewing, Coding)
                | (Testing, Committing)
                | (Testing, Coding)
                | (Committing, Closed)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Queued => "queued",
            RunState::Planning => "planning",
            RunState::Coding => "coding",
            RunState::Reviewing => "reviewing",
            RunState::Testing => "testing",
            RunState::Committing => "committing",
            RunState::Closed => "closed",
            RunState::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Retry budget counters, one per retryable step
///
/// Used both as the configured budget and as the remaining counts carried
/// by a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryBudgets {
    /// Re-asking the planner after an empty plan or a transient failure
    pub planning: u32,
    /// Re-asking the coder after unparseable output or a transient failure
    pub coding: u32,
    /// Regenerating a candidate after a rejected review
    pub regeneration: u32,
    /// Regenerating after failed tests, or re-running tests after a transient sandbox error
    pub testing: u32,
    /// Rebase-and-push retries and transient source-control errors
    pub committing: u32,
}

impl Default for RetryBudgets {
    fn default() -> Self {
        Self {
            planning: 1,
            coding: 2,
            regeneration: 2,
            testing: 2,
            committing: 3,
        }
    }
}

/// Which retry counter a retry draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryScope {
    Planning,
    Coding,
    Regeneration,
    Testing,
    Committing,
}

impl fmt::Display for RetryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RetryScope::Planning => "planning",
            RetryScope::Coding => "coding",
            RetryScope::Regeneration => "regeneration",
            RetryScope::Testing => "testing",
            RetryScope::Committing => "committing",
        };
        f.write_str(s)
    }
}

impl RetryBudgets {
    fn slot(&mut self, scope: RetryScope) -> &mut u32 {
        match scope {
            RetryScope::Planning => &mut self.planning,
            RetryScope::Coding => &mut self.coding,
            RetryScope::Regeneration => &mut self.regeneration,
            RetryScope::Testing => &mut self.testing,
            RetryScope::Committing => &mut self.committing,
        }
    }

    pub fn remaining(&self, scope: RetryScope) -> u32 {
        let mut copy = *self;
        *copy.slot(scope)
    }

    /// Takes one retry from `scope`; `false` when the budget is spent
    pub fn consume(&mut self, scope: RetryScope) -> bool {
        let slot = self.slot(scope);
        if *slot == 0 {
            return false;
        }
        *slot -= 1;
        true
    }
}

/// Why a run stopped in `blocked`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    /// Every provider bound to the role failed or was exhausted
    ProvidersExhausted { role: Role },
    /// A retry budget reached zero
    RetryBudgetExhausted { scope: RetryScope, detail: String },
    /// The active candidate was rejected and no regeneration budget remains
    ReviewRejected { candidate: Uuid },
    /// A collaborator reported a persistent error
    Collaborator { message: String },
    /// An operator cancelled the run
    Cancelled,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::ProvidersExhausted { role } => {
                write!(f, "all providers failed for role '{}'", role)
            }
            BlockReason::RetryBudgetExhausted { scope, detail } => {
                write!(f, "{} retry budget exhausted: {}", scope, detail)
            }
            BlockReason::ReviewRejected { candidate } => {
                write!(f, "candidate {} rejected by safety review", candidate)
            }
            BlockReason::Collaborator { message } => write!(f, "collaborator error: {}", message),
            BlockReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: RunState,
    pub to: RunState,
    pub at: DateTime<Utc>,
    pub note: String,
}

/// Commit produced by the source control agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    pub project: String,
    pub sha: String,
    pub branch: String,
}

/// Result of running a project's tests in the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub passed: bool,
    pub exit_code: i32,
    /// Combined output, truncated
    pub output: String,
}

/// Progress through the side-effecting committing sub-steps
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitProgress {
    pub commit: Option<CommitRef>,
    pub pushed: bool,
    pub issue_closed: bool,
}

/// Errors raised by invalid run state changes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("run {run} cannot move from {from} to {to}")]
    NotAllowed { run: Uuid, from: RunState, to: RunState },

    #[error("run {0} cannot leave reviewing: active candidate is not approved or overridden")]
    CandidateNotCleared(Uuid),
}

/// One issue being resolved
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub issue: IssueRef,
    pub state: RunState,
    pub history: Vec<Transition>,
    pub plan: Option<String>,
    /// All candidates generated for this run, oldest first
    pub candidates: Vec<PatchCandidate>,
    pub active_candidate: Option<Uuid>,
    /// Context carried into the next generation (rejection rationale, test output)
    pub feedback: Option<String>,
    pub retries: RetryBudgets,
    pub last_test: Option<TestReport>,
    pub commit: CommitProgress,
    pub block_reason: Option<BlockReason>,
    /// State the run was in when it was blocked
    pub blocked_from: Option<RunState>,
    /// Incremented on every persisted checkpoint
    pub checkpoint_seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(issue: IssueRef, retries: RetryBudgets) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            issue,
            state: RunState::Queued,
            history: Vec::new(),
            plan: None,
            candidates: Vec::new(),
            active_candidate: None,
            feedback: None,
            retries,
            last_test: None,
            commit: CommitProgress::default(),
            block_reason: None,
            blocked_from: None,
            checkpoint_seq: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn active_candidate(&self) -> Option<&PatchCandidate> {
        let id = self.active_candidate?;
        self.candidates.iter().find(|c| c.id == id)
    }

    pub fn active_candidate_mut(&mut self) -> Option<&mut PatchCandidate> {
        let id = self.active_candidate?;
        self.candidates.iter_mut().find(|c| c.id == id)
    }

    /// Records a freshly generated candidate and makes it the active one
    pub fn push_candidate(&mut self, candidate: PatchCandidate) {
        self.active_candidate = Some(candidate.id);
        self.candidates.push(candidate);
        self.updated_at = Utc::now();
    }

    /// Moves the run along the automatic state machine
    pub fn advance(&mut self, to: RunState, note: impl Into<String>) -> Result<(), TransitionError> {
        if !self.state.can_advance_to(to) {
            return Err(TransitionError::NotAllowed {
                run: self.id,
                from: self.state,
                to,
            });
        }

        let leaves_review = matches!(
            (self.state, to),
            (RunState::Reviewing, RunState::Testing)
        );
        if leaves_review && !self.active_candidate().is_some_and(|c| c.is_cleared()) {
            return Err(TransitionError::CandidateNotCleared(self.id));
        }

        self.record(to, note.into());
        Ok(())
    }

    /// Moves any non-terminal run to `blocked`
    pub fn block(&mut self, reason: BlockReason) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::NotAllowed {
                run: self.id,
                from: self.state,
                to: RunState::Blocked,
            });
        }
        self.blocked_from = Some(self.state);
        let note = reason.to_string();
        self.block_reason = Some(reason);
        self.record(RunState::Blocked, note);
        Ok(())
    }

    /// Manual intervention: a blocked run whose active candidate was
    /// overridden re-enters `reviewing`
    pub fn resume_after_override(&mut self, operator: &str) -> Result<(), TransitionError> {
        if self.state != RunState::Blocked
            || !self
                .active_candidate()
                .is_some_and(|c| c.verdict() == crate::domain::patch::Verdict::Override)
        {
            return Err(TransitionError::NotAllowed {
                run: self.id,
                from: self.state,
                to: RunState::Reviewing,
            });
        }
        self.block_reason = None;
        self.blocked_from = None;
        self.record(RunState::Reviewing, format!("override by {}", operator));
        Ok(())
    }

    fn record(&mut self, to: RunState, note: String) {
        let now = Utc::now();
        self.history.push(Transition {
            from: self.state,
            to,
            at: now,
            note,
        });
        self.state = to;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::patch::{FileChange, GeneratedBy, ReviewVerdict, Verdict};
    use crate::domain::provider::ProviderId;

    fn issue() -> IssueRef {
        IssueRef {
            project: "shop".to_string(),
            repo: "acme/shop".to_string(),
            number: 42,
            title: "Broken login".to_string(),
            body: String::new(),
            labels: vec!["aidev".to_string()],
            url: None,
        }
    }

    fn candidate() -> PatchCandidate {
        PatchCandidate::new(
            1,
            vec![FileChange {
                path: "a.txt".to_string(),
                content: "x".to_string(),
            }],
            "plan".to_string(),
            GeneratedBy {
                role: Role::Coder,
                provider: ProviderId::new("p", "m"),
            },
        )
    }

    fn run_at_reviewing() -> PipelineRun {
        let mut run = PipelineRun::new(issue(), RetryBudgets::default());
        run.advance(RunState::Planning, "admitted").unwrap();
        run.advance(RunState::Coding, "planned").unwrap();
        run.push_candidate(candidate());
        run.advance(RunState::Reviewing, "generated").unwrap();
        run
    }

    #[test]
    fn test_happy_path_transitions_are_recorded() {
        let run = run_at_reviewing();
        assert_eq!(run.state, RunState::Reviewing);
        assert_eq!(run.history.len(), 3);
        assert_eq!(run.history[0].from, RunState::Queued);
        assert_eq!(run.history[2].to, RunState::Reviewing);
    }

    #[test]
    fn test_cannot_leave_review_with_pending_or_rejected_candidate() {
        let mut run = run_at_reviewing();
        assert!(matches!(
            run.advance(RunState::Testing, "x"),
            Err(TransitionError::CandidateNotCleared(_))
        ));

        let rejected = ReviewVerdict {
            verdict: Verdict::Rejected,
            categories: vec![],
            findings: vec![],
            rationale: String::new(),
            overridden_by: None,
        };
        run.active_candidate_mut().unwrap().attach_verdict(rejected).unwrap();
        assert!(run.advance(RunState::Testing, "x").is_err());
        assert!(run.advance(RunState::Coding, "regenerate").is_ok());
    }

    #[test]
    fn test_skipping_states_is_refused() {
        let mut run = PipelineRun::new(issue(), RetryBudgets::default());
        assert!(run.advance(RunState::Coding, "skip").is_err());
        assert!(run.advance(RunState::Closed, "skip").is_err());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut run = PipelineRun::new(issue(), RetryBudgets::default());
        run.block(BlockReason::Cancelled).unwrap();
        assert_eq!(run.blocked_from, Some(RunState::Queued));
        assert!(run.block(BlockReason::Cancelled).is_err());
        assert!(run.advance(RunState::Planning, "again").is_err());
    }

    #[test]
    fn test_resume_after_override_requires_overridden_candidate() {
        let mut run = run_at_reviewing();
        let rejected = ReviewVerdict {
            verdict: Verdict::Rejected,
            categories: vec![],
            findings: vec![],
            rationale: String::new(),
            overridden_by: None,
        };
        run.active_candidate_mut().unwrap().attach_verdict(rejected).unwrap();
        run.block(BlockReason::ReviewRejected {
            candidate: run.active_candidate.unwrap(),
        })
        .unwrap();

        assert!(run.resume_after_override("ops").is_err());

        run.active_candidate_mut()
            .unwrap()
            .apply_override("ops", "intended")
            .unwrap();
        run.resume_after_override("ops").unwrap();
        assert_eq!(run.state, RunState::Reviewing);
        assert!(run.block_reason.is_none());
        assert!(run.advance(RunState::Testing, "overridden").is_ok());
    }

    #[test]
    fn test_retry_budgets_consume_to_zero() {
        let mut budgets = RetryBudgets {
            regeneration: 2,
            ..RetryBudgets::default()
        };
        assert!(budgets.consume(RetryScope::Regeneration));
        assert_eq!(budgets.remaining(RetryScope::Regeneration), 1);
        assert!(budgets.consume(RetryScope::Regeneration));
        assert!(!budgets.consume(RetryScope::Regeneration));
        assert_eq!(budgets.remaining(RetryScope::Regeneration), 0);
    }
}
