//! Issue domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of an issue across polls: repository plus number
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IssueKey {
    /// Repository in `owner/repo` form
    pub repo: String,
    pub number: u64,
}

impl fmt::Display for IssueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

/// Scheduling priority; earlier variants are admitted first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    fn from_label(label: &str) -> Option<Self> {
        match label.to_lowercase().as_str() {
            "critical" | "priority:critical" => Some(Priority::Critical),
            "high" | "priority:high" => Some(Priority::High),
            "medium" | "priority:medium" => Some(Priority::Medium),
            "low" | "priority:low" => Some(Priority::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// An issue picked up from the tracker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRef {
    /// Name of the configured project the issue belongs to
    pub project: String,
    pub repo: String,
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl IssueRef {
    pub fn key(&self) -> IssueKey {
        IssueKey {
            repo: self.repo.clone(),
            number: self.number,
        }
    }

    /// Priority from the first priority label, else from body markers
    /// (`urgent`/`critical`, `high priority`), else medium
    pub fn priority(&self) -> Priority {
        if let Some(priority) = self.labels.iter().find_map(|l| Priority::from_label(l)) {
            return priority;
        }
        let body = self.body.to_lowercase();
        if body.contains("urgent") || body.contains("critical") {
            Priority::Critical
        } else if body.contains("high priority") {
            Priority::High
        } else {
            Priority::Medium
        }
    }
}

impl fmt::Display for IssueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(labels: &[&str], body: &str) -> IssueRef {
        IssueRef {
            project: "shop".to_string(),
            repo: "acme/shop".to_string(),
            number: 1,
            title: "Broken login".to_string(),
            body: body.to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            url: None,
        }
    }

    #[test]
    fn test_priority_from_labels() {
        assert_eq!(issue(&["aidev", "Critical"], "").priority(), Priority::Critical);
        assert_eq!(issue(&["priority:high"], "").priority(), Priority::High);
        assert_eq!(issue(&["aidev", "low"], "urgent").priority(), Priority::Low);
    }

    #[test]
    fn test_priority_from_body_markers() {
        assert_eq!(issue(&["aidev"], "This is URGENT").priority(), Priority::Critical);
        assert_eq!(issue(&[], "fairly high priority").priority(), Priority::High);
        assert_eq!(issue(&["aidev"], "Users cannot log in").priority(), Priority::Medium);
    }

    #[test]
    fn test_priority_orders_critical_first() {
        let mut all = vec![Priority::Low, Priority::Critical, Priority::Medium, Priority::High];
        all.sort();
        assert_eq!(
            all,
            vec![Priority::Critical, Priority::High, Priority::Medium, Priority::Low]
        );
    }
}
