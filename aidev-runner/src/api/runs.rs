//! Run API Handlers
//!
//! HTTP endpoints for inspecting runs and for manual intervention.

use aidev_core::domain::run::PipelineRun;
use aidev_core::dto::run::{CancelRequest, OverrideRequest, RunSummary};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::scheduler::CancelOutcome;

/// GET /api/runs
/// List live runs
pub async fn list_runs(State(state): State<AppState>) -> ApiResult<Json<Vec<RunSummary>>> {
    tracing::debug!("Listing runs");
    Ok(Json(state.scheduler.runs().await))
}

/// GET /api/runs/{id}
/// Full run record with candidates and history
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PipelineRun>> {
    tracing::debug!("Getting run: {}", id);

    state
        .scheduler
        .run(id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Run {} not found", id)))
}

/// POST /api/runs/{id}/cancel
/// Cancel a run; a run being driven stops at its next suspension point
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelRequest>>,
) -> ApiResult<StatusCode> {
    let operator = body.and_then(|Json(req)| req.operator);
    tracing::info!("Cancelling run {}", id);

    match state.scheduler.cancel(id, operator).await? {
        CancelOutcome::Signalled => Ok(StatusCode::ACCEPTED),
        CancelOutcome::Blocked => Ok(StatusCode::OK),
    }
}

/// POST /api/runs/{id}/override
/// Override the rejected candidate of a blocked run
pub async fn override_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<OverrideRequest>,
) -> ApiResult<Json<PipelineRun>> {
    if req.operator.trim().is_empty() {
        return Err(ApiError::BadRequest("operator is required".to_string()));
    }
    if req.reason.trim().is_empty() {
        return Err(ApiError::BadRequest("reason is required".to_string()));
    }
    tracing::info!("Override of run {} requested by {}", id, req.operator);

    let run = state
        .scheduler
        .override_run(id, &req.operator, &req.reason)
        .await?;
    Ok(Json(run))
}

/// DELETE /api/runs/{id}
/// Dismiss a blocked run and release its issue
pub async fn dismiss_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    tracing::info!("Dismissing run {}", id);
    state.scheduler.dismiss(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
