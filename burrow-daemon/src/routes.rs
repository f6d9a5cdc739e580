//! Route configuration.

use crate::handlers;
use crate::state::AppState;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let storage_routes = Router::new()
        .route(
            "/1.0/storage-pools/{pool}/volumes",
            get(handlers::volumes::list_all).post(handlers::volumes::create_untyped),
        )
        .route(
            "/1.0/storage-pools/{pool}/volumes/{type}",
            get(handlers::volumes::list_typed).post(handlers::volumes::create_typed),
        )
        .route(
            "/1.0/storage-pools/{pool}/volumes/{type}/{name}",
            get(handlers::volumes::get)
                .put(handlers::volumes::put)
                .patch(handlers::volumes::patch)
                .post(handlers::volumes::post)
                .delete(handlers::volumes::delete),
        )
        .route(
            "/1.0/storage-pools/{pool}/volumes/{type}/{name}/snapshots",
            get(handlers::snapshots::list).post(handlers::snapshots::create),
        )
        .route(
            "/1.0/storage-pools/{pool}/volumes/{type}/{name}/snapshots/{snap}",
            get(handlers::snapshots::get)
                .put(handlers::snapshots::put)
                .patch(handlers::snapshots::patch)
                .post(handlers::snapshots::post)
                .delete(handlers::snapshots::delete),
        );

    let operation_routes = Router::new()
        .route(
            "/1.0/operations/{id}",
            get(handlers::operations::get).delete(handlers::operations::cancel),
        )
        .route("/1.0/operations/{id}/wait", get(handlers::operations::wait));

    // Internal endpoints: trusted-only surface, mounted outside /1.0.
    let internal_routes = Router::new()
        .route("/internal/recover/validate", post(handlers::recover::validate))
        .route("/internal/recover/import", post(handlers::recover::import));

    Router::new()
        .merge(storage_routes)
        .merge(operation_routes)
        .merge(internal_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
