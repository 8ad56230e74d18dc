//! Run DTOs
//!
//! Data transfer objects for run-related operator operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::patch::Verdict;
use crate::domain::run::{BlockReason, PipelineRun, RunState};

/// Request to override the rejected active candidate of a blocked run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideRequest {
    /// Operator issuing the override
    pub operator: String,

    /// Why the rejection is being superseded
    pub reason: String,
}

/// Request to cancel a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelRequest {
    /// Operator issuing the cancellation
    pub operator: Option<String>,
}

/// Summary information about a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,

    /// Issue in `owner/repo#number` form
    pub issue: String,

    pub title: String,

    pub state: RunState,

    /// Number of candidates generated so far
    pub candidate_count: usize,

    /// Verdict of the active candidate, if any
    pub active_verdict: Option<Verdict>,

    pub block_reason: Option<BlockReason>,

    /// Whether a worker currently owns the run
    pub in_progress: bool,

    pub updated_at: DateTime<Utc>,
}

impl RunSummary {
    pub fn from_run(run: &PipelineRun, in_progress: bool) -> Self {
        RunSummary {
            id: run.id,
            issue: run.issue.to_string(),
            title: run.issue.title.clone(),
            state: run.state,
            candidate_count: run.candidates.len(),
            active_verdict: run.active_candidate().map(|c| c.verdict()),
            block_reason: run.block_reason.clone(),
            in_progress,
            updated_at: run.updated_at,
        }
    }
}
