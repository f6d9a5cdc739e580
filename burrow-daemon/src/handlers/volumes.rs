//! Storage volume handlers.

use crate::response::{ApiError, ApiResponse, ApiResult};
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::{HeaderMap, CONTENT_TYPE, IF_MATCH};
use burrow_core::types::api::{VolumePost, VolumePut, VolumesPost};
use burrow_core::types::VolumeType;
use burrow_core::{Error, Outcome};
use serde::Deserialize;
use tracing::instrument;

/// Header selecting ISO vs backup import for octet-stream uploads.
const HEADER_UPLOAD_TYPE: &str = "x-burrow-type";

/// Header naming the uploaded artifact's destination volume.
const HEADER_UPLOAD_NAME: &str = "x-burrow-name";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListQuery {
    pub project: Option<String>,
    #[serde(rename = "all-projects")]
    pub all_projects: Option<String>,
    pub filter: Option<String>,
    pub recursion: Option<u8>,
    pub target: Option<String>,
}

fn project_param(query: &ListQuery) -> &str {
    query.project.as_deref().unwrap_or("default")
}

fn parse_type(name: &str) -> Result<VolumeType, ApiError> {
    VolumeType::parse(name)
        .ok_or_else(|| ApiError(Error::BadRequest(format!("Invalid storage volume type {:?}", name))))
}

fn outcome_response(outcome: Outcome) -> ApiResponse {
    match outcome {
        Outcome::Done => ApiResponse::empty_sync(),
        Outcome::Async(op) => ApiResponse::operation(&op),
    }
}

/// `GET /1.0/storage-pools/{pool}/volumes`
#[instrument(skip(state, query))]
pub async fn list_all(
    State(state): State<AppState>,
    Path(pool): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    list_volumes(state, pool, None, query).await
}

/// `GET /1.0/storage-pools/{pool}/volumes/{type}`
#[instrument(skip(state, query))]
pub async fn list_typed(
    State(state): State<AppState>,
    Path((pool, type_name)): Path<(String, String)>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let volume_type = parse_type(&type_name)?;
    list_volumes(state, pool, Some(volume_type), query).await
}

async fn list_volumes(
    state: AppState,
    pool: String,
    volume_type: Option<VolumeType>,
    query: ListQuery,
) -> ApiResult {
    let all_projects = query.all_projects.as_deref() == Some("1");

    let mut volumes = state
        .volumes
        .list(&pool, query.project.as_deref(), all_projects, volume_type)
        .await?;

    if let Some(filter) = &query.filter {
        if !filter.is_empty() {
            volumes.retain(|v| v.name.contains(filter.as_str()));
        }
    }

    // Recursion 0 answers with resource URLs only.
    if query.recursion.unwrap_or(0) == 0 {
        let urls: Vec<String> = volumes
            .iter()
            .map(|v| {
                format!("/1.0/storage-pools/{}/volumes/{}/{}", pool, v.volume_type, v.name)
            })
            .collect();
        return Ok(ApiResponse::sync(urls));
    }

    Ok(ApiResponse::sync(volumes))
}

/// `POST /1.0/storage-pools/{pool}/volumes` (untyped)
pub async fn create_untyped(
    state: State<AppState>,
    path: Path<String>,
    query: Query<ListQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    let Path(pool) = path;
    create_volume(state.0, pool, None, query.0, headers, body).await
}

/// `POST /1.0/storage-pools/{pool}/volumes/{type}`
pub async fn create_typed(
    state: State<AppState>,
    path: Path<(String, String)>,
    query: Query<ListQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    let Path((pool, type_name)) = path;
    create_volume(state.0, pool, Some(type_name), query.0, headers, body).await
}

#[instrument(skip(state, headers, body), fields(pool = %pool))]
async fn create_volume(
    state: AppState,
    pool: String,
    type_name: Option<String>,
    query: ListQuery,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    let project = project_param(&query);

    // Binary uploads are ISO or backup imports, selected by header.
    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or("");
    if content_type == "application/octet-stream" {
        let name = headers
            .get(HEADER_UPLOAD_NAME)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let upload_type =
            headers.get(HEADER_UPLOAD_TYPE).and_then(|v| v.to_str().ok()).unwrap_or("");

        let outcome = if upload_type == "iso" {
            state.volumes.import_iso(&pool, project, &name, body.as_ref()).await?
        } else {
            state.volumes.import_backup(&pool, project, &name, body.as_ref()).await?
        };

        return Ok(outcome_response(outcome));
    }

    let mut req: VolumesPost = serde_json::from_slice(&body)
        .map_err(|e| Error::BadRequest(format!("Invalid request body: {}", e)))?;

    // The typed URL wins over the body's type field.
    if let Some(type_name) = type_name {
        req.volume_type = type_name;
    }

    let outcome = state.volumes.create(&pool, project, req).await?;
    Ok(outcome_response(outcome))
}

/// `GET /1.0/storage-pools/{pool}/volumes/{type}/{name}`
#[instrument(skip(state, query))]
pub async fn get(
    State(state): State<AppState>,
    Path((pool, type_name, name)): Path<(String, String, String)>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let volume_type = parse_type(&type_name)?;
    let (info, etag) = state.volumes.get(&pool, project_param(&query), volume_type, &name).await?;
    Ok(ApiResponse::sync(info).with_etag(etag))
}

/// `PUT /1.0/storage-pools/{pool}/volumes/{type}/{name}`
#[instrument(skip(state, query, headers, req))]
pub async fn put(
    State(state): State<AppState>,
    Path((pool, type_name, name)): Path<(String, String, String)>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
    axum::Json(req): axum::Json<VolumePut>,
) -> ApiResult {
    let volume_type = parse_type(&type_name)?;
    let if_match = headers.get(IF_MATCH).and_then(|v| v.to_str().ok());

    state
        .volumes
        .update(&pool, project_param(&query), volume_type, &name, req, if_match)
        .await?;

    Ok(ApiResponse::empty_sync())
}

/// `PATCH /1.0/storage-pools/{pool}/volumes/{type}/{name}`
#[instrument(skip(state, query, headers, req))]
pub async fn patch(
    State(state): State<AppState>,
    Path((pool, type_name, name)): Path<(String, String, String)>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
    axum::Json(req): axum::Json<VolumePut>,
) -> ApiResult {
    let volume_type = parse_type(&type_name)?;
    let if_match = headers.get(IF_MATCH).and_then(|v| v.to_str().ok());

    state
        .volumes
        .patch(&pool, project_param(&query), volume_type, &name, req, if_match)
        .await?;

    Ok(ApiResponse::empty_sync())
}

/// `POST /1.0/storage-pools/{pool}/volumes/{type}/{name}` — rename, move
/// or migrate.
#[instrument(skip(state, query, req))]
pub async fn post(
    State(state): State<AppState>,
    Path((pool, type_name, name)): Path<(String, String, String)>,
    Query(query): Query<ListQuery>,
    axum::Json(req): axum::Json<VolumePost>,
) -> ApiResult {
    let volume_type = parse_type(&type_name)?;

    let outcome = state
        .volumes
        .rename_or_move(
            &pool,
            project_param(&query),
            volume_type,
            &name,
            req,
            query.target.as_deref(),
        )
        .await?;

    Ok(outcome_response(outcome))
}

/// `DELETE /1.0/storage-pools/{pool}/volumes/{type}/{name}`
#[instrument(skip(state, query))]
pub async fn delete(
    State(state): State<AppState>,
    Path((pool, type_name, name)): Path<(String, String, String)>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let volume_type = parse_type(&type_name)?;

    state.volumes.delete(&pool, project_param(&query), volume_type, &name).await?;

    Ok(ApiResponse::empty_sync())
}
