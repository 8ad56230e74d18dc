//! Source control repository
//!
//! Drives the `git` CLI against the project's local checkout. The checkout
//! is owned by the daemon: `prepare` discards any local state and resets to
//! the remote branch.

use aidev_core::domain::patch::{FileChange, PatchCandidate};
use aidev_core::domain::run::CommitRef;
use async_trait::async_trait;
use std::path::{Component, Path};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::error::{CollabResult, CollaboratorError};
use crate::config::ProjectConfig;

/// Repository trait for source control operations
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Fetches the remote and resets the checkout to the remote branch
    async fn prepare(&self, project: &ProjectConfig) -> CollabResult<()>;

    /// Writes a change set into the working tree
    async fn write_changes(&self, project: &ProjectConfig, changes: &[FileChange])
    -> CollabResult<()>;

    /// Resets, writes the candidate and commits it
    ///
    /// When the tree already matches the candidate (the commit was made and
    /// pushed before a restart) the current HEAD is returned instead.
    async fn apply_patch(
        &self,
        project: &ProjectConfig,
        candidate: &PatchCandidate,
        message: &str,
    ) -> CollabResult<CommitRef>;

    /// Pushes HEAD to the project branch
    ///
    /// A rejected non-fast-forward push yields `RebaseRequired`.
    async fn push(&self, project: &ProjectConfig) -> CollabResult<()>;

    /// Rebases local commits onto the remote branch, returning the new HEAD
    async fn rebase(&self, project: &ProjectConfig) -> CollabResult<CommitRef>;
}

/// `git` CLI implementation of SourceControl
pub struct GitSourceControl {
    author_name: String,
    author_email: String,
}

impl GitSourceControl {
    pub fn new(author_name: impl Into<String>, author_email: impl Into<String>) -> Self {
        Self {
            author_name: author_name.into(),
            author_email: author_email.into(),
        }
    }

    /// Runs git in `dir`, returning trimmed stdout
    async fn git(&self, dir: &Path, args: &[&str]) -> CollabResult<String> {
        debug!("git {} (in {})", args.join(" "), dir.display());

        let output = Command::new("git")
            .arg("-C")
            .arg(dir)
            .arg("-c")
            .arg(format!("user.name={}", self.author_name))
            .arg("-c")
            .arg(format!("user.email={}", self.author_email))
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CollaboratorError::Persistent(format!("Failed to execute git: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify(args, &stderr))
    }

    async fn head(&self, project: &ProjectConfig) -> CollabResult<CommitRef> {
        let sha = self.git(&project.path, &["rev-parse", "HEAD"]).await?;
        Ok(CommitRef {
            project: project.name.clone(),
            sha,
            branch: project.branch.clone(),
        })
    }
}

/// Sorts git failures into retryable and final ones
fn classify(args: &[&str], stderr: &str) -> CollaboratorError {
    let lower = stderr.to_lowercase();
    let message = format!("git {} failed: {}", args.first().unwrap_or(&""), stderr);

    if args.first() == Some(&"push")
        && (lower.contains("rejected")
            || lower.contains("non-fast-forward")
            || lower.contains("fetch first"))
    {
        return CollaboratorError::RebaseRequired(message);
    }
    if lower.contains("could not resolve host")
        || lower.contains("connection timed out")
        || lower.contains("connection reset")
        || lower.contains("unable to access")
        || lower.contains("index.lock")
    {
        return CollaboratorError::Transient(message);
    }
    CollaboratorError::Persistent(message)
}

/// Rejects paths that would escape the checkout or touch git metadata
fn checked_path(root: &Path, relative: &str) -> CollabResult<std::path::PathBuf> {
    let path = Path::new(relative);
    let escapes = path.components().any(|c| {
        !matches!(c, Component::Normal(_) | Component::CurDir)
            || c.as_os_str() == ".git"
    });
    if relative.is_empty() || escapes {
        return Err(CollaboratorError::Persistent(format!(
            "refusing to write outside the project: {}",
            relative
        )));
    }
    Ok(root.join(path))
}

#[async_trait]
impl SourceControl for GitSourceControl {
    async fn prepare(&self, project: &ProjectConfig) -> CollabResult<()> {
        let upstream = format!("{}/{}", project.remote, project.branch);
        self.git(&project.path, &["fetch", &project.remote, &project.branch])
            .await?;
        self.git(&project.path, &["checkout", "-B", &project.branch, &upstream])
            .await?;
        self.git(&project.path, &["reset", "--hard", &upstream]).await?;
        self.git(&project.path, &["clean", "-fd"]).await?;
        debug!("Checkout of {} reset to {}", project.name, upstream);
        Ok(())
    }

    async fn write_changes(
        &self,
        project: &ProjectConfig,
        changes: &[FileChange],
    ) -> CollabResult<()> {
        for change in changes {
            let target = checked_path(&project.path, &change.path)?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &change.content).await?;
            debug!("Wrote {} ({} bytes)", change.path, change.content.len());
        }
        Ok(())
    }

    async fn apply_patch(
        &self,
        project: &ProjectConfig,
        candidate: &PatchCandidate,
        message: &str,
    ) -> CollabResult<CommitRef> {
        self.prepare(project).await?;
        self.write_changes(project, &candidate.changes).await?;
        self.git(&project.path, &["add", "-A"]).await?;

        let staged = self
            .git(&project.path, &["diff", "--cached", "--name-only"])
            .await?;
        if staged.is_empty() {
            warn!(
                "Nothing to commit for candidate {}; tree already matches",
                candidate.id
            );
            return self.head(project).await;
        }

        self.git(&project.path, &["commit", "-m", message]).await?;
        let commit = self.head(project).await?;
        info!("Committed {} on {} ({})", commit.sha, project.branch, project.name);
        Ok(commit)
    }

    async fn push(&self, project: &ProjectConfig) -> CollabResult<()> {
        let refspec = format!("HEAD:{}", project.branch);
        self.git(&project.path, &["push", &project.remote, &refspec])
            .await?;
        info!("Pushed {} to {}/{}", project.name, project.remote, project.branch);
        Ok(())
    }

    async fn rebase(&self, project: &ProjectConfig) -> CollabResult<CommitRef> {
        self.git(&project.path, &["fetch", &project.remote, &project.branch])
            .await?;
        let upstream = format!("{}/{}", project.remote, project.branch);
        if let Err(e) = self.git(&project.path, &["rebase", &upstream]).await {
            let _ = self.git(&project.path, &["rebase", "--abort"]).await;
            return Err(CollaboratorError::Persistent(format!(
                "rebase onto {} failed: {}",
                upstream, e
            )));
        }
        let commit = self.head(project).await?;
        info!("Rebased {} onto {} ({})", project.name, upstream, commit.sha);
        Ok(commit)
    }
}
