//! Response envelopes.
//!
//! Every endpoint answers with one of three envelopes: a synchronous
//! result, a background-operation reference, or an error.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use burrow_core::ops::Operation;
use burrow_core::Error;
use serde::Serialize;
use serde_json::json;

/// Result type for API handlers.
pub type ApiResult = std::result::Result<ApiResponse, ApiError>;

/// A rendered API response.
pub struct ApiResponse {
    body: serde_json::Value,
    status: StatusCode,
    etag: Option<String>,
}

impl ApiResponse {
    /// Synchronous success carrying `metadata`.
    pub fn sync<T: Serialize>(metadata: T) -> Self {
        Self {
            body: json!({
                "type": "sync",
                "status": "Success",
                "status_code": 200,
                "metadata": metadata,
            }),
            status: StatusCode::OK,
            etag: None,
        }
    }

    /// Synchronous success with no metadata.
    pub fn empty_sync() -> Self {
        Self::sync(serde_json::Value::Null)
    }

    /// Attach an ETag header.
    pub fn with_etag(mut self, etag: String) -> Self {
        self.etag = Some(etag);
        self
    }

    /// Background operation reference.
    pub fn operation(op: &Operation) -> Self {
        Self {
            body: json!({
                "type": "async",
                "status": "Operation created",
                "status_code": 100,
                "operation": op.url(),
                "metadata": op.info(),
            }),
            status: StatusCode::ACCEPTED,
            etag: None,
        }
    }
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.body)).into_response();
        if let Some(etag) = self.etag {
            if let Ok(value) = header::HeaderValue::from_str(&etag) {
                response.headers_mut().insert(header::ETAG, value);
            }
        }
        response
    }
}

/// Error envelope wrapper around the core error type.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            Error::OfflineCluster(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Cancelled => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "type": "error",
            "error_code": status.as_u16(),
            "error": self.0.to_string(),
        });

        (status, Json(body)).into_response()
    }
}
