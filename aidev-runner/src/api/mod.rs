//! API Module
//!
//! Operator HTTP API: run inspection, manual intervention and provider
//! status. Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod health;
pub mod providers;
pub mod runs;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::scheduler::Scheduler;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

/// Create the main API router with all endpoints
pub fn create_router(scheduler: Arc<Scheduler>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Run endpoints
        .route("/api/runs", get(runs::list_runs))
        .route("/api/runs/{id}", get(runs::get_run).delete(runs::dismiss_run))
        .route("/api/runs/{id}/cancel", post(runs::cancel_run))
        .route("/api/runs/{id}/override", post(runs::override_run))
        // Provider endpoints
        .route("/api/providers", get(providers::list_providers))
        // Add state and middleware
        .with_state(AppState { scheduler })
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::EnqueueOutcome;
    use crate::testing::{CLEAN_PATCH, Harness, Reply, issue};
    use aidev_core::domain::run::{BlockReason, PipelineRun, RunState};
    use aidev_core::dto::provider::ProviderStatus;
    use aidev_core::dto::run::RunSummary;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn json<T: DeserializeOwned>(body: &[u8]) -> T {
        serde_json::from_slice(body).unwrap()
    }

    async fn fixture() -> (Harness, Arc<Scheduler>, Router, Uuid) {
        let h = Harness::new(vec![Reply::Text(CLEAN_PATCH)]).await;
        let scheduler = h.scheduler(1);
        let EnqueueOutcome::Accepted(id) = scheduler.enqueue(issue(42)).await.unwrap() else {
            panic!("expected accepted");
        };
        let router = create_router(scheduler.clone());
        (h, scheduler, router, id)
    }

    #[tokio::test]
    async fn test_health() {
        let (_h, _scheduler, router, _) = fixture().await;
        let (status, body) = send(&router, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"OK");
    }

    #[tokio::test]
    async fn test_list_and_get_runs() {
        let (_h, _scheduler, router, id) = fixture().await;

        let (status, body) = send(&router, get_req("/api/runs")).await;
        assert_eq!(status, StatusCode::OK);
        let runs: Vec<RunSummary> = json(&body);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, id);
        assert_eq!(runs[0].issue, "acme/shop#42");
        assert_eq!(runs[0].state, RunState::Queued);

        let (status, body) = send(&router, get_req(&format!("/api/runs/{}", id))).await;
        assert_eq!(status, StatusCode::OK);
        let run: PipelineRun = json(&body);
        assert_eq!(run.id, id);

        let (status, body) =
            send(&router, get_req(&format!("/api/runs/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let error: serde_json::Value = json(&body);
        assert!(error["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_cancel_then_dismiss() {
        let (_h, scheduler, router, id) = fixture().await;

        let cancel = Request::builder()
            .method("POST")
            .uri(format!("/api/runs/{}/cancel", id))
            .header("content-type", "application/json")
            .body(Body::from(r#"{"operator":"ops"}"#))
            .unwrap();
        let (status, _) = send(&router, cancel).await;
        assert_eq!(status, StatusCode::OK);
        let run = scheduler.run(id).await.unwrap();
        assert_eq!(run.block_reason, Some(BlockReason::Cancelled));

        let dismiss = Request::builder()
            .method("DELETE")
            .uri(format!("/api/runs/{}", id))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&router, dismiss).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(scheduler.run(id).await.is_none());
    }

    #[tokio::test]
    async fn test_override_validation_and_conflict() {
        let (_h, _scheduler, router, id) = fixture().await;

        let blank = Request::builder()
            .method("POST")
            .uri(format!("/api/runs/{}/override", id))
            .header("content-type", "application/json")
            .body(Body::from(r#"{"operator":"","reason":"x"}"#))
            .unwrap();
        let (status, _) = send(&router, blank).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // A queued run has nothing to override.
        let queued = Request::builder()
            .method("POST")
            .uri(format!("/api/runs/{}/override", id))
            .header("content-type", "application/json")
            .body(Body::from(r#"{"operator":"ops","reason":"intended"}"#))
            .unwrap();
        let (status, _) = send(&router, queued).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_list_providers() {
        let (_h, _scheduler, router, _) = fixture().await;
        let (status, body) = send(&router, get_req("/api/providers")).await;
        assert_eq!(status, StatusCode::OK);
        let providers: Vec<ProviderStatus> = json(&body);
        assert_eq!(providers.len(), 4);
        assert!(providers.iter().any(|p| p.id == "coder:model"));
    }
}
