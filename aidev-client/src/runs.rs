//! Run-related API endpoints

use aidev_core::domain::run::PipelineRun;
use aidev_core::dto::run::{CancelRequest, OverrideRequest, RunSummary};
use tracing::debug;
use uuid::Uuid;

use crate::OperatorClient;
use crate::error::Result;

impl OperatorClient {
    // =============================================================================
    // Run Inspection
    // =============================================================================

    /// List live runs
    pub async fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let url = format!("{}/api/runs", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Get a run with its candidates, verdicts and history
    pub async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun> {
        let url = format!("{}/api/runs/{}", self.base_url, run_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Manual Intervention
    // =============================================================================

    /// Cancel a run
    ///
    /// A run being driven stops at its next suspension point; a waiting run
    /// is blocked immediately.
    pub async fn cancel_run(&self, run_id: Uuid, operator: Option<String>) -> Result<()> {
        let url = format!("{}/api/runs/{}/cancel", self.base_url, run_id);
        debug!("Cancelling run {}", run_id);
        let response = self
            .client
            .post(&url)
            .json(&CancelRequest { operator })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Override the rejected candidate of a blocked run
    ///
    /// # Example
    /// ```no_run
    /// # use aidev_client::OperatorClient;
    /// # async fn example(run_id: uuid::Uuid) -> aidev_client::Result<()> {
    /// let client = OperatorClient::new("http://localhost:8700");
    /// let run = client
    ///     .override_run(run_id, "alice", "the DROP runs against a scratch table")
    ///     .await?;
    /// println!("run is now {}", run.state);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn override_run(
        &self,
        run_id: Uuid,
        operator: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<PipelineRun> {
        let url = format!("{}/api/runs/{}/override", self.base_url, run_id);
        let request = OverrideRequest {
            operator: operator.into(),
            reason: reason.into(),
        };
        let response = self.client.post(&url).json(&request).send().await?;

        self.handle_response(response).await
    }

    /// Dismiss a blocked run, releasing its issue
    pub async fn dismiss_run(&self, run_id: Uuid) -> Result<()> {
        let url = format!("{}/api/runs/{}", self.base_url, run_id);
        let response = self.client.delete(&url).send().await?;

        self.handle_empty_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_list_runs() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("GET"))
            .and(path("/api/runs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "id": id,
                "issue": "acme/shop#42",
                "title": "Broken login",
                "state": "blocked",
                "candidate_count": 1,
                "active_verdict": "rejected",
                "block_reason": {"kind": "review_rejected", "candidate": Uuid::nil()},
                "in_progress": false,
                "updated_at": "2026-01-01T00:00:00Z"
            }])))
            .mount(&server)
            .await;

        let runs = OperatorClient::new(server.uri()).list_runs().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, id);
        assert_eq!(runs[0].issue, "acme/shop#42");
    }

    #[tokio::test]
    async fn test_override_sends_operator_and_reason() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("POST"))
            .and(path(format!("/api/runs/{}/override", id)))
            .and(body_json(json!({"operator": "alice", "reason": "scratch table"})))
            .respond_with(
                ResponseTemplate::new(409).set_body_json(json!({"error": "run is queued"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = OperatorClient::new(server.uri())
            .override_run(id, "alice", "scratch table")
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(err.to_string().contains("run is queued"));
    }

    #[tokio::test]
    async fn test_dismiss_and_cancel() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("DELETE"))
            .and(path(format!("/api/runs/{}", id)))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/api/runs/{}/cancel", id)))
            .and(body_json(json!({"operator": null})))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let client = OperatorClient::new(server.uri());
        client.dismiss_run(id).await.unwrap();
        client.cancel_run(id, None).await.unwrap();

        let missing = client.get_run(Uuid::new_v4()).await.unwrap_err();
        assert!(missing.is_not_found());
    }
}
