//! Task text for planning and coding calls

use aidev_core::domain::issue::IssueRef;

use crate::config::ProjectConfig;

const MAX_BODY_CHARS: usize = 2_000;
const MAX_PLAN_CHARS: usize = 4_000;
const MAX_FEEDBACK_CHARS: usize = 6_000;

fn clip(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{} [...]", &text[..idx]),
        None => text.to_string(),
    }
}

fn constraints(project: &ProjectConfig) -> String {
    match (&project.language, &project.language_version) {
        (Some(language), Some(version)) => format!(
            "- Code must run on {} {}; do not use syntax introduced after that version\n",
            language, version
        ),
        _ => String::new(),
    }
}

pub fn plan_task(issue: &IssueRef, project: &ProjectConfig) -> String {
    format!(
        "Plan a fix for this issue:\n\n\
         Title: {}\n\
         Description: {}\n\n\
         Constraints:\n{}\
         - Keep the change as small as possible\n\
         - Never drop tables, delete data or hardcode credentials\n\n\
         Provide:\n\
         1. Root cause analysis\n\
         2. Step-by-step fix plan\n\
         3. Files to modify\n\
         4. Test approach",
        issue.title,
        clip(&issue.body, MAX_BODY_CHARS),
        constraints(project)
    )
}

/// Coding task; `feedback` carries the previous rejection or test failure
pub fn code_task(
    issue: &IssueRef,
    project: &ProjectConfig,
    plan: &str,
    feedback: Option<&str>,
    attempt: u32,
) -> String {
    let mut task = format!(
        "Generate code to fix this issue.\n\n\
         Issue: {}\n\
         Description: {}\n\n\
         Plan:\n{}\n\n\
         Constraints:\n{}\
         - Write complete file contents, not diffs\n\
         - Paths are relative to the project root\n\n\
         Output format: for each file, use this format:\n\
         === FILE: path/to/file.ext ===\n\
         <file content>\n\
         === END FILE ===",
        issue.title,
        clip(&issue.body, MAX_BODY_CHARS),
        clip(plan, MAX_PLAN_CHARS),
        constraints(project)
    );

    if let Some(feedback) = feedback {
        task.push_str(&format!(
            "\n\nAttempt {}. The previous attempt was not accepted:\n{}\n\nAddress every point above.",
            attempt,
            clip(feedback, MAX_FEEDBACK_CHARS)
        ));
    }
    task
}

pub fn commit_message(issue: &IssueRef) -> String {
    format!("Fix #{}: {}", issue.number, issue.title)
}
