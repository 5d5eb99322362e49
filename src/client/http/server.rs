//! HTTP server setup and management

use axum::{
    routing::get,
    Router,
};
use tower_http::cors::CorsLayer;
use super::handlers::{AppState, health, status};
use crate::proxy::StatusCache;

/// Routes of the status API
pub fn router(cache: StatusCache) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(AppState::new(cache))
}

/// Start the HTTP server
pub async fn start(bind: &str, port: u16, cache: StatusCache) -> crate::Result<()> {
    let app = router(cache);

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", bind, port)).await?;
    tracing::info!("HTTP status server listening on http://{}:{}/status", bind, port);

    axum::serve(listener, app).await?;
    Ok(())
}
