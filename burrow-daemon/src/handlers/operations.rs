//! Operation handlers.

use crate::response::{ApiResponse, ApiResult};
use crate::state::AppState;
use axum::extract::{Path, State};
use tracing::instrument;

/// `GET /1.0/operations/{id}`
#[instrument(skip(state))]
pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let op = state.server.operations.get(&id)?;
    Ok(ApiResponse::sync(op.info()))
}

/// `GET /1.0/operations/{id}/wait` — block until the operation reaches a
/// terminal state, then return it.
#[instrument(skip(state))]
pub async fn wait(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let op = state.server.operations.get(&id)?;
    let _ = op.wait().await;
    Ok(ApiResponse::sync(op.info()))
}

/// `DELETE /1.0/operations/{id}` — request cancellation.
#[instrument(skip(state))]
pub async fn cancel(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let op = state.server.operations.get(&id)?;
    op.cancel().await;
    Ok(ApiResponse::empty_sync())
}
