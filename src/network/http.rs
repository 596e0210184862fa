//! Status HTTP Surface
//!
//! Read-only side channel next to the WebSocket endpoint.

use std::future::Future;

use axum::{extract::State, routing::get, Json, Router};
use tokio::net::TcpListener;

use crate::game::directory::{PlayerEntry, SharedDirectory};

/// Create the status routes.
pub fn routes(directory: SharedDirectory) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/players", get(list_players))
        .with_state(directory)
}

/// Serve the status routes until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, directory: SharedDirectory, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, routes(directory))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health() -> &'static str {
    "OK"
}

async fn list_players(State(directory): State<SharedDirectory>) -> Json<Vec<PlayerEntry>> {
    Json(directory.lock().await.players())
}
