//! Health check endpoint

use axum::http::StatusCode;
use axum::response::IntoResponse;

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
