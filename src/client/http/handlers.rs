//! HTTP request handlers

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use super::models::{ErrorResponse, HealthResponse, StatusQuery};
use crate::proxy::{ProxyError, StatusCache, StatusFilter};

/// Shared state for the HTTP server
#[derive(Clone)]
pub struct AppState {
    cache: StatusCache,
}

impl AppState {
    pub fn new(cache: StatusCache) -> Self {
        Self { cache }
    }
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "sessionproxy",
        running: state.cache.is_running(),
        sessions: state.cache.len(),
    })
}

/// Status endpoint handler
///
/// Fresh data is served from the cache; a `state` filter always goes to the
/// core. Transport failures answer 502, partial results 206.
pub async fn status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Response {
    let ids = query.ids();
    let fields = query.fields();

    let result = match query.state {
        Some(session_state) => {
            let filter = StatusFilter {
                ids,
                state: Some(session_state),
                ..Default::default()
            };
            state.cache.query_filtered(&filter, fields.as_deref()).await
        }
        None => state.cache.query(ids.as_deref(), fields.as_deref()).await,
    };

    match result {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(ProxyError::Partial { status, failed, source }) => {
            tracing::warn!("partial status for {} failed sessions: {}", failed.len(), source);
            (StatusCode::PARTIAL_CONTENT, Json(status)).into_response()
        }
        Err(e) => {
            tracing::error!("status query failed: {}", e);
            let body = ErrorResponse { error: e.to_string() };
            (StatusCode::BAD_GATEWAY, Json(body)).into_response()
        }
    }
}
