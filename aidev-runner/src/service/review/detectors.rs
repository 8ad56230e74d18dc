//! Safety detectors
//!
//! A closed set of independent detectors. Each one is a pure function from
//! a file's text to the findings of its category.

use aidev_core::domain::patch::{Finding, RuleCategory};
use regex::Regex;
use std::sync::LazyLock;

use super::compat::LanguageTarget;

static SQL_DESTRUCTIVE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bDROP\s+(?:TABLE|DATABASE|SCHEMA)\b",
        r"(?i)\bTRUNCATE\s+TABLE\b",
        r"(?i)\bALTER\s+TABLE\s+[`\x22\w.]+\s+DROP\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static SQL_DELETE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bDELETE\s+FROM\s+[`\x22\w.]+").unwrap());

static SQL_WHERE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bWHERE\b").unwrap());

static SECRETS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"(?i)(?:password|passwd|pwd)\s*=>?\s*["'][^"']{8,}["']"#,
        r#"(?i)(?:api_key|apikey|api_secret)\s*=>?\s*["'][^"']{8,}["']"#,
        r#"(?i)(?:token|secret)\s*=>?\s*["'][^"']{16,}["']"#,
        r"nvapi-[a-zA-Z0-9_-]{20,}",
        r"ghp_[a-zA-Z0-9]{36,}",
        r"sk-[a-zA-Z0-9]{20,}",
        r"\bAKIA[0-9A-Z]{16}\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static UNSAFE_SHELL: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\brm\s+(?:-[a-zA-Z]*r[a-zA-Z]*f[a-zA-Z]*|-[a-zA-Z]*f[a-zA-Z]*r[a-zA-Z]*|-r\s+-f|-f\s+-r)\s+(?:/|~|\$HOME)",
        r"--no-preserve-root",
        r"(?i)\b(?:curl|wget)\b[^|\n]*\|\s*(?:sudo\s+)?(?:ba|z|da)?sh\b",
        r"\bchmod\s+(?:-R\s+)?0?777\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Shows the first characters of a secret only
fn mask(secret: &str) -> String {
    let visible: String = secret.chars().take(10).collect();
    format!("{}***", visible)
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("//")
        || trimmed.starts_with("/*")
        || trimmed.starts_with('*')
        || (trimmed.starts_with('#') && !trimmed.starts_with("#["))
}

/// One safety check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detector {
    DestructiveSql,
    HardcodedSecret,
    UnsafeShell,
    /// Syntax newer than the project's declared version floor
    LanguageCompat(LanguageTarget),
}

impl Detector {
    /// The detectors every candidate goes through
    pub fn standard() -> Vec<Detector> {
        vec![
            Detector::DestructiveSql,
            Detector::HardcodedSecret,
            Detector::UnsafeShell,
        ]
    }

    pub fn category(&self) -> RuleCategory {
        match self {
            Detector::DestructiveSql => RuleCategory::DestructiveSql,
            Detector::HardcodedSecret => RuleCategory::HardcodedSecret,
            Detector::UnsafeShell => RuleCategory::UnsafeShell,
            Detector::LanguageCompat(_) => RuleCategory::LanguageIncompatible,
        }
    }

    /// Scans one file's text; line numbers are 1-based
    pub fn scan(&self, path: &str, text: &str) -> Vec<Finding> {
        let lines: Vec<&str> = text.lines().collect();
        let mut findings = Vec::new();

        for (idx, line) in lines.iter().enumerate() {
            let messages = match self {
                Detector::DestructiveSql => sql_findings(line, lines.get(idx + 1).copied()),
                Detector::HardcodedSecret => SECRETS
                    .iter()
                    .filter_map(|re| re.find(line))
                    .map(|m| format!("Possible hardcoded secret: {}", mask(m.as_str())))
                    .collect(),
                Detector::UnsafeShell => UNSAFE_SHELL
                    .iter()
                    .filter_map(|re| re.find(line))
                    .map(|m| format!("Unsafe shell command: {}", m.as_str().trim()))
                    .collect(),
                Detector::LanguageCompat(target) => {
                    if !target.applies_to(path) || is_comment(line) {
                        continue;
                    }
                    target
                        .violations(line)
                        .map(|rule| {
                            format!(
                                "{} requires {} {}, target is {}",
                                rule.name, target.language, rule.since, target
                            )
                        })
                        .collect()
                }
            };

            findings.extend(messages.into_iter().map(|message| Finding {
                category: self.category(),
                path: path.to_string(),
                line: idx + 1,
                message,
            }));
        }

        findings
    }
}

/// Destructive statements on `line`; an unscoped DELETE may carry its WHERE
/// on the following line
fn sql_findings(line: &str, next: Option<&str>) -> Vec<String> {
    let mut messages: Vec<String> = SQL_DESTRUCTIVE
        .iter()
        .filter_map(|re| re.find(line))
        .map(|m| format!("Destructive SQL detected: {}", m.as_str()))
        .collect();

    if let Some(m) = SQL_DELETE.find(line) {
        let rest = &line[m.end()..];
        let scoped = SQL_WHERE.is_match(rest)
            || (rest.trim().is_empty() && next.is_some_and(|n| SQL_WHERE.is_match(n)));
        if !scoped {
            messages.push(format!("Unscoped DELETE detected: {}", m.as_str()));
        }
    }

    messages
}
