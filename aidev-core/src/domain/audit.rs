//! Audit event types
//!
//! Every state transition, gateway call outcome and review verdict is
//! appended to the audit log as one of these events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::issue::IssueKey;
use crate::domain::patch::{RuleCategory, Verdict};
use crate::domain::provider::{ProviderErrorKind, ProviderId, Role};
use crate::domain::run::{BlockReason, RunState};

/// An append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub run_id: Option<Uuid>,
    #[serde(flatten)]
    pub kind: AuditKind,
}

impl AuditEvent {
    pub fn new(run_id: Option<Uuid>, kind: AuditKind) -> Self {
        Self {
            at: Utc::now(),
            run_id,
            kind,
        }
    }

    pub fn for_run(run_id: Uuid, kind: AuditKind) -> Self {
        Self::new(Some(run_id), kind)
    }
}

/// Outcome of one provider attempt inside a gateway call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CallOutcome {
    Succeeded { tokens: u64 },
    Failed { error: ProviderErrorKind, message: String },
    /// Not contacted because the call would exceed the quota ceiling
    QuotaRefused,
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditKind {
    RunEnqueued {
        issue: IssueKey,
    },
    Transition {
        from: RunState,
        to: RunState,
        note: String,
    },
    GatewayCall {
        role: Role,
        provider: ProviderId,
        outcome: CallOutcome,
    },
    /// The role had no routable provider left
    GatewayExhausted {
        role: Role,
        attempts: usize,
    },
    ReviewVerdict {
        candidate: Uuid,
        verdict: Verdict,
        categories: Vec<RuleCategory>,
        rationale: String,
    },
    Override {
        candidate: Uuid,
        operator: String,
        reason: String,
    },
    Cancelled {
        operator: Option<String>,
    },
    Blocked {
        reason: BlockReason,
    },
    CheckpointFailed {
        state: RunState,
        message: String,
    },
    CollaboratorRetry {
        state: RunState,
        message: String,
    },
    Dismissed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_event_serializes_flat_with_event_tag() {
        let event = AuditEvent::for_run(
            Uuid::nil(),
            AuditKind::Transition {
                from: RunState::Reviewing,
                to: RunState::Coding,
                note: "regenerate".to_string(),
            },
        );

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "transition");
        assert_eq!(value["from"], "reviewing");
        assert_eq!(value["to"], "coding");
        assert_eq!(value["run_id"], Uuid::nil().to_string());

        let back: AuditEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
