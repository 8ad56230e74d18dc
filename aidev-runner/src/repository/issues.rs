//! Issue tracker repository
//!
//! Talks to the GitHub REST API:
//! - Listing open issues carrying the trigger label
//! - Labelling and commenting when work starts
//! - Commenting and closing when a fix is pushed
//! - Commenting when a run is blocked

use aidev_core::domain::issue::IssueRef;
use aidev_core::domain::run::{BlockReason, CommitRef};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::error::{CollabResult, CollaboratorError};
use crate::config::ProjectConfig;

/// Label added while a run is working on an issue
pub const WIP_LABEL: &str = "aidev-wip";

/// Repository trait for the issue tracker
#[async_trait]
pub trait IssueSource: Send + Sync {
    /// Lists open issues of `project` carrying `label`, oldest first
    ///
    /// Pull requests are never returned.
    async fn poll_new_issues(&self, project: &ProjectConfig, label: &str)
    -> CollabResult<Vec<IssueRef>>;

    /// Tells watchers that a run picked the issue up
    async fn mark_in_progress(&self, issue: &IssueRef) -> CollabResult<()>;

    /// Comments with the fix commit and closes the issue
    async fn close_issue(&self, issue: &IssueRef, commit: &CommitRef) -> CollabResult<()>;

    /// Comments with the reason a run stopped
    async fn report_blocked(&self, issue: &IssueRef, reason: &BlockReason) -> CollabResult<()>;
}

#[derive(Debug, Deserialize)]
struct GitHubIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<GitHubLabel>,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GitHubLabel {
    name: String,
}

/// GitHub REST implementation of IssueSource
pub struct GitHubIssueSource {
    client: Client,
    api_url: String,
    token: Option<String>,
}

impl GitHubIssueSource {
    /// Creates a new GitHub issue source
    ///
    /// # Arguments
    /// * `api_url` - API root (e.g., "https://api.github.com")
    /// * `token` - Personal access token; unauthenticated when `None`
    pub fn new(api_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "aidev");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn comment(&self, issue: &IssueRef, body: String) -> CollabResult<()> {
        let url = format!(
            "{}/repos/{}/issues/{}/comments",
            self.api_url, issue.repo, issue.number
        );
        let response = self
            .request(self.client.post(&url))
            .json(&json!({ "body": body }))
            .send()
            .await?;
        check(response, "comment on issue").await?;
        Ok(())
    }
}

/// Maps a non-success response to a collaborator error
async fn check(response: Response, action: &str) -> CollabResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("Failed to {}: {} - {}", action, status, body);
    let throttled = status == StatusCode::FORBIDDEN && body.to_lowercase().contains("rate limit");
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || throttled {
        Err(CollaboratorError::Transient(message))
    } else {
        Err(CollaboratorError::Persistent(message))
    }
}

#[async_trait]
impl IssueSource for GitHubIssueSource {
    async fn poll_new_issues(
        &self,
        project: &ProjectConfig,
        label: &str,
    ) -> CollabResult<Vec<IssueRef>> {
        let url = format!("{}/repos/{}/issues", self.api_url, project.repo);

        let response = self
            .request(self.client.get(&url))
            .query(&[
                ("state", "open"),
                ("labels", label),
                ("sort", "created"),
                ("direction", "asc"),
                ("per_page", "100"),
            ])
            .send()
            .await?;
        let issues = check(response, "list issues")
            .await?
            .json::<Vec<GitHubIssue>>()
            .await
            .map_err(|e| CollaboratorError::Persistent(format!("Failed to parse issue list: {}", e)))?;

        let found: Vec<IssueRef> = issues
            .into_iter()
            .filter(|issue| issue.pull_request.is_none())
            .map(|issue| IssueRef {
                project: project.name.clone(),
                repo: project.repo.clone(),
                number: issue.number,
                title: issue.title,
                body: issue.body.unwrap_or_default(),
                labels: issue.labels.into_iter().map(|l| l.name).collect(),
                url: issue.html_url,
            })
            .collect();

        debug!("Found {} labelled issues in {}", found.len(), project.repo);
        Ok(found)
    }

    async fn mark_in_progress(&self, issue: &IssueRef) -> CollabResult<()> {
        let url = format!(
            "{}/repos/{}/issues/{}/labels",
            self.api_url, issue.repo, issue.number
        );
        let response = self
            .request(self.client.post(&url))
            .json(&json!({ "labels": [WIP_LABEL] }))
            .send()
            .await?;
        check(response, "label issue").await?;

        self.comment(
            issue,
            "**aidev** is now working on this issue.\n\nI'll update this issue when the fix is ready."
                .to_string(),
        )
        .await?;

        info!("Marked issue {} as in progress", issue);
        Ok(())
    }

    async fn close_issue(&self, issue: &IssueRef, commit: &CommitRef) -> CollabResult<()> {
        self.comment(
            issue,
            format!(
                "**aidev** has resolved this issue.\n\n**Commit:** `{}` on `{}`\n",
                commit.sha, commit.branch
            ),
        )
        .await?;

        let url = format!(
            "{}/repos/{}/issues/{}",
            self.api_url, issue.repo, issue.number
        );
        let response = self
            .request(self.client.patch(&url))
            .json(&json!({ "state": "closed", "state_reason": "completed" }))
            .send()
            .await?;
        check(response, "close issue").await?;

        info!("Closed issue {} with commit {}", issue, commit.sha);
        Ok(())
    }

    async fn report_blocked(&self, issue: &IssueRef, reason: &BlockReason) -> CollabResult<()> {
        self.comment(
            issue,
            format!(
                "**aidev** stopped working on this issue.\n\n**Reason:** {}\n\nAn operator can override or dismiss the run.",
                reason
            ),
        )
        .await
    }
}
