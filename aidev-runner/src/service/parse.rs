//! Parsing coder output into file changes
//!
//! The coder answers with blocks of the form:
//!
//! ```text
//! === FILE: path/to/file.ext ===
//! <content>
//! === END FILE ===
//! ```

use aidev_core::domain::patch::FileChange;
use std::path::{Component, Path};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("response contains no file blocks")]
    NoFiles,

    #[error("file block for '{0}' is never closed")]
    Unterminated(String),

    #[error("path '{0}' is not inside the project")]
    UnsafePath(String),
}

const FILE_OPEN: &str = "=== FILE:";
const FILE_CLOSE: &str = "=== END FILE ===";

/// Relative, no `..`, no git metadata
fn check_path(path: &str) -> Result<(), ParseError> {
    let p = Path::new(path);
    let ok = !path.is_empty()
        && p.components().all(|c| match c {
            Component::Normal(part) => part != ".git",
            Component::CurDir => true,
            _ => false,
        });
    if ok {
        Ok(())
    } else {
        Err(ParseError::UnsafePath(path.to_string()))
    }
}

/// Drops a Markdown fence wrapped around a file body
fn strip_fence(lines: &[&str]) -> String {
    let mut body = lines;
    if body.first().is_some_and(|l| l.trim_start().starts_with("```")) {
        body = &body[1..];
        if body.last().is_some_and(|l| l.trim() == "```") {
            body = &body[..body.len() - 1];
        }
    }
    let mut text = body.join("\n");
    text.push('\n');
    text
}

pub fn parse_files(response: &str) -> Result<Vec<FileChange>, ParseError> {
    let mut changes: Vec<FileChange> = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in response.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix(FILE_OPEN) {
            if let Some((path, _)) = current.take() {
                return Err(ParseError::Unterminated(path));
            }
            let path = rest.trim().trim_end_matches("===").trim().to_string();
            let path = path.trim_start_matches("./").to_string();
            check_path(&path)?;
            current = Some((path, Vec::new()));
        } else if trimmed == FILE_CLOSE {
            if let Some((path, lines)) = current.take() {
                let content = strip_fence(&lines);
                // A later block for the same path replaces the earlier one.
                changes.retain(|c| c.path != path);
                changes.push(FileChange { path, content });
            }
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
    }

    if let Some((path, _)) = current {
        return Err(ParseError::Unterminated(path));
    }
    if changes.is_empty() {
        return Err(ParseError::NoFiles);
    }
    Ok(changes)
}
