use burrow_core::catalog::Catalog;
use burrow_core::server::Server;
use burrow_core::{paths, Error};
use std::collections::HashMap;
use tracing::info;

mod handlers;
mod response;
mod routes;
mod scheduler;
mod state;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("burrow daemon starting");

    let db_path = std::env::var("BURROW_DB_PATH")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| paths::db_path());

    let catalog = Catalog::new(&db_path).await?;

    // Bootstrap the standalone member and the default project on first run.
    let member_name =
        std::env::var("BURROW_MEMBER_NAME").unwrap_or_else(|_| "none".to_string());

    let member_id = match catalog.member_by_name(&member_name).await {
        Ok(member) => member.id,
        Err(Error::NotFound(_)) => catalog.insert_member(&member_name, "").await?,
        Err(e) => return Err(e.into()),
    };

    if catalog.project("default").await.is_err() {
        catalog.insert_project("default", &HashMap::new()).await?;
    }

    let server = Server::standalone(catalog, &member_name, member_id);
    let state = state::AppState::new(server);

    let scheduler_shutdown = scheduler::spawn(state.snapshots.clone());

    let addr = std::env::var("BURROW_LISTEN").unwrap_or_else(|_| "127.0.0.1:8444".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "API listening");

    let router = routes::create_router(state);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await?;

    let _ = scheduler_shutdown.send(true);
    info!("burrow daemon shutting down");

    Ok(())
}
