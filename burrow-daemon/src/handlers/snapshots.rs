//! Volume snapshot handlers.

use crate::handlers::volumes::ListQuery;
use crate::response::{ApiError, ApiResponse, ApiResult};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::header::{HeaderMap, IF_MATCH};
use burrow_core::types::api::{SnapshotPost, SnapshotPut, SnapshotsPost};
use burrow_core::types::VolumeType;
use burrow_core::Error;
use tracing::instrument;

fn require_custom(type_name: &str) -> Result<(), ApiError> {
    if VolumeType::parse(type_name) != Some(VolumeType::Custom) {
        return Err(ApiError(Error::BadRequest(format!(
            "Invalid storage volume type {:?}",
            type_name
        ))));
    }
    Ok(())
}

fn project_param(query: &ListQuery) -> &str {
    query.project.as_deref().unwrap_or("default")
}

/// `GET /1.0/storage-pools/{pool}/volumes/{type}/{name}/snapshots`
#[instrument(skip(state, query))]
pub async fn list(
    State(state): State<AppState>,
    Path((pool, type_name, name)): Path<(String, String, String)>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    require_custom(&type_name)?;

    let snapshots = state.snapshots.list(&pool, project_param(&query), &name).await?;

    if query.recursion.unwrap_or(0) == 0 {
        let urls: Vec<String> = snapshots
            .iter()
            .filter_map(|s| s.name.split('/').next_back())
            .map(|snap| {
                format!(
                    "/1.0/storage-pools/{}/volumes/custom/{}/snapshots/{}",
                    pool, name, snap
                )
            })
            .collect();
        return Ok(ApiResponse::sync(urls));
    }

    Ok(ApiResponse::sync(snapshots))
}

/// `POST /1.0/storage-pools/{pool}/volumes/{type}/{name}/snapshots`
#[instrument(skip(state, query, req))]
pub async fn create(
    State(state): State<AppState>,
    Path((pool, type_name, name)): Path<(String, String, String)>,
    Query(query): Query<ListQuery>,
    axum::Json(req): axum::Json<SnapshotsPost>,
) -> ApiResult {
    require_custom(&type_name)?;

    let op = state.snapshots.create(&pool, project_param(&query), &name, req).await?;
    Ok(ApiResponse::operation(&op))
}

/// `GET /…/snapshots/{snap}`
#[instrument(skip(state, query))]
pub async fn get(
    State(state): State<AppState>,
    Path((pool, type_name, name, snap)): Path<(String, String, String, String)>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    require_custom(&type_name)?;

    let (info, etag) = state.snapshots.get(&pool, project_param(&query), &name, &snap).await?;
    Ok(ApiResponse::sync(info).with_etag(etag))
}

/// `PUT /…/snapshots/{snap}`
#[instrument(skip(state, query, headers, req))]
pub async fn put(
    State(state): State<AppState>,
    Path((pool, type_name, name, snap)): Path<(String, String, String, String)>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
    axum::Json(req): axum::Json<SnapshotPut>,
) -> ApiResult {
    require_custom(&type_name)?;
    let if_match = headers.get(IF_MATCH).and_then(|v| v.to_str().ok());

    state
        .snapshots
        .update(&pool, project_param(&query), &name, &snap, req, if_match)
        .await?;

    Ok(ApiResponse::empty_sync())
}

/// `PATCH /…/snapshots/{snap}` — merges over the current state, which for
/// a snapshot is the same update path with optional fields.
#[instrument(skip(state, query, headers, req))]
pub async fn patch(
    State(state): State<AppState>,
    Path((pool, type_name, name, snap)): Path<(String, String, String, String)>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
    axum::Json(req): axum::Json<SnapshotPut>,
) -> ApiResult {
    require_custom(&type_name)?;
    let if_match = headers.get(IF_MATCH).and_then(|v| v.to_str().ok());

    state
        .snapshots
        .update(&pool, project_param(&query), &name, &snap, req, if_match)
        .await?;

    Ok(ApiResponse::empty_sync())
}

/// `POST /…/snapshots/{snap}` — rename.
#[instrument(skip(state, query, req))]
pub async fn post(
    State(state): State<AppState>,
    Path((pool, type_name, name, snap)): Path<(String, String, String, String)>,
    Query(query): Query<ListQuery>,
    axum::Json(req): axum::Json<SnapshotPost>,
) -> ApiResult {
    require_custom(&type_name)?;

    state.snapshots.rename(&pool, project_param(&query), &name, &snap, &req.name).await?;

    Ok(ApiResponse::empty_sync())
}

/// `DELETE /…/snapshots/{snap}`
#[instrument(skip(state, query))]
pub async fn delete(
    State(state): State<AppState>,
    Path((pool, type_name, name, snap)): Path<(String, String, String, String)>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    require_custom(&type_name)?;

    state.snapshots.delete(&pool, project_param(&query), &name, &snap).await?;

    Ok(ApiResponse::empty_sync())
}
