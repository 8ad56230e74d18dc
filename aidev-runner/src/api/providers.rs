//! Provider API Handlers
//!
//! Read-only view of the provider registry.

use aidev_core::dto::provider::ProviderStatus;
use axum::{Json, extract::State};

use crate::api::AppState;
use crate::api::error::ApiResult;

/// GET /api/providers
/// Quota and health of every registered provider profile
pub async fn list_providers(State(state): State<AppState>) -> ApiResult<Json<Vec<ProviderStatus>>> {
    tracing::debug!("Listing providers");

    let providers = state
        .scheduler
        .pipeline()
        .gateway()
        .registry()
        .snapshot()
        .await
        .iter()
        .map(ProviderStatus::from)
        .collect();

    Ok(Json(providers))
}
