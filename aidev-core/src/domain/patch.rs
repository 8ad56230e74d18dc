//! Patch candidate and review verdict types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::provider::{ProviderId, Role};

/// New contents for one file of the project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Path relative to the project root
    pub path: String,
    pub content: String,
}

/// Which role and provider produced a candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedBy {
    pub role: Role,
    pub provider: ProviderId,
}

/// Review outcome for a patch candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pending,
    Approved,
    Rejected,
    Override,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pending => write!(f, "pending"),
            Verdict::Approved => write!(f, "approved"),
            Verdict::Rejected => write!(f, "rejected"),
            Verdict::Override => write!(f, "override"),
        }
    }
}

/// Safety rule category a detector can match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    DestructiveSql,
    HardcodedSecret,
    UnsafeShell,
    LanguageIncompatible,
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleCategory::DestructiveSql => write!(f, "destructive_sql"),
            RuleCategory::HardcodedSecret => write!(f, "hardcoded_secret"),
            RuleCategory::UnsafeShell => write!(f, "unsafe_shell"),
            RuleCategory::LanguageIncompatible => write!(f, "language_incompatible"),
        }
    }
}

/// One detector hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub category: RuleCategory,
    pub path: String,
    pub line: usize,
    pub message: String,
}

/// Verdict attached 1:1 to a patch candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub verdict: Verdict,
    /// Distinct matched categories, sorted
    pub categories: Vec<RuleCategory>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    pub rationale: String,
    #[serde(default)]
    pub overridden_by: Option<String>,
}

impl ReviewVerdict {
    pub fn pending() -> Self {
        Self {
            verdict: Verdict::Pending,
            categories: Vec::new(),
            findings: Vec::new(),
            rationale: String::new(),
            overridden_by: None,
        }
    }
}

/// Errors raised when a verdict transition is not allowed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerdictError {
    #[error("candidate {0} already carries verdict '{1}'")]
    AlreadyReviewed(Uuid, Verdict),

    #[error("candidate {0} has verdict '{1}'; only rejected candidates can be overridden")]
    NotRejected(Uuid, Verdict),
}

/// One AI-proposed code change
///
/// The change set and plan are fixed at creation; only the review verdict
/// is attached afterwards. A rejected candidate is replaced by a new one,
/// never edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchCandidate {
    pub id: Uuid,
    /// 1-based generation attempt within the run
    pub attempt: u32,
    pub changes: Vec<FileChange>,
    pub plan: String,
    pub generated_by: GeneratedBy,
    pub created_at: DateTime<Utc>,
    pub review: ReviewVerdict,
}

impl PatchCandidate {
    pub fn new(attempt: u32, changes: Vec<FileChange>, plan: String, generated_by: GeneratedBy) -> Self {
        Self {
            id: Uuid::new_v4(),
            attempt,
            changes,
            plan,
            generated_by,
            created_at: Utc::now(),
            review: ReviewVerdict::pending(),
        }
    }

    pub fn verdict(&self) -> Verdict {
        self.review.verdict
    }

    /// Approved or overridden: the run may move past `reviewing`
    pub fn is_cleared(&self) -> bool {
        matches!(self.review.verdict, Verdict::Approved | Verdict::Override)
    }

    /// Renders the change set as added-line diff text, one section per file
    pub fn diff_text(&self) -> String {
        let mut out = String::new();
        for change in &self.changes {
            out.push_str(&format!("+++ b/{}\n", change.path));
            for line in change.content.lines() {
                out.push('+');
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }

    /// Attaches the reviewer's verdict to a pending candidate
    pub fn attach_verdict(&mut self, verdict: ReviewVerdict) -> Result<(), VerdictError> {
        if self.review.verdict != Verdict::Pending {
            return Err(VerdictError::AlreadyReviewed(self.id, self.review.verdict));
        }
        self.review = verdict;
        Ok(())
    }

    /// Supersedes a `rejected` verdict with an operator override
    ///
    /// The matched categories are kept for the record.
    pub fn apply_override(&mut self, operator: &str, reason: &str) -> Result<(), VerdictError> {
        if self.review.verdict != Verdict::Rejected {
            return Err(VerdictError::NotRejected(self.id, self.review.verdict));
        }
        self.review.verdict = Verdict::Override;
        self.review.overridden_by = Some(operator.to_string());
        self.review.rationale = format!(
            "{}\noverridden by {}: {}",
            self.review.rationale, operator, reason
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate() -> PatchCandidate {
        PatchCandidate::new(
            1,
            vec![FileChange {
                path: "src/app.php".to_string(),
                content: "<?php\necho 1;\n".to_string(),
            }],
            "plan".to_string(),
            GeneratedBy {
                role: Role::Coder,
                provider: ProviderId::new("nvidia", "coder-model"),
            },
        )
    }

    fn rejected() -> ReviewVerdict {
        ReviewVerdict {
            verdict: Verdict::Rejected,
            categories: vec![RuleCategory::DestructiveSql],
            findings: vec![],
            rationale: "destructive_sql".to_string(),
            overridden_by: None,
        }
    }

    #[test]
    fn test_diff_text_marks_every_line_added() {
        let text = candidate().diff_text();
        assert_eq!(text, "+++ b/src/app.php\n+<?php\n+echo 1;\n");
    }

    #[test]
    fn test_verdict_attaches_once() {
        let mut c = candidate();
        c.attach_verdict(rejected()).unwrap();
        assert_eq!(c.verdict(), Verdict::Rejected);
        assert!(c.attach_verdict(rejected()).is_err());
    }

    #[test]
    fn test_override_only_supersedes_rejected() {
        let mut c = candidate();
        assert!(matches!(
            c.apply_override("ops", "fine"),
            Err(VerdictError::NotRejected(_, Verdict::Pending))
        ));

        c.attach_verdict(rejected()).unwrap();
        c.apply_override("ops", "migration is intended").unwrap();
        assert_eq!(c.verdict(), Verdict::Override);
        assert!(c.is_cleared());
        assert_eq!(c.review.categories, vec![RuleCategory::DestructiveSql]);

        // A second override of the same candidate is refused.
        assert!(c.apply_override("ops", "again").is_err());
    }
}
