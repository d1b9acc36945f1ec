//! Egress proxy pool handlers

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::api::server::AppState;

/// Per-proxy usage in pool order
pub async fn list_proxies(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.selector.stats())
}
