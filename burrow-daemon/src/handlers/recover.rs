//! Recovery handlers (internal API).

use crate::response::{ApiResponse, ApiResult};
use crate::state::AppState;
use axum::extract::State;
use burrow_core::types::api::RecoverValidatePost;
use tracing::instrument;

/// `POST /internal/recover/validate`
#[instrument(skip(state, req), fields(pools = req.pools.len()))]
pub async fn validate(
    State(state): State<AppState>,
    axum::Json(req): axum::Json<RecoverValidatePost>,
) -> ApiResult {
    let result = state.recovery.scan(req.pools, true).await?;
    Ok(ApiResponse::sync(result))
}

/// `POST /internal/recover/import`
#[instrument(skip(state, req), fields(pools = req.pools.len()))]
pub async fn import(
    State(state): State<AppState>,
    axum::Json(req): axum::Json<RecoverValidatePost>,
) -> ApiResult {
    let result = state.recovery.scan(req.pools, false).await?;

    // Dependency errors surface as a report, not as silence.
    if result.dependency_errors.is_empty() && result.unknown_volumes.is_empty() {
        return Ok(ApiResponse::empty_sync());
    }

    Ok(ApiResponse::sync(result))
}
