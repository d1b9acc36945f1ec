use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::api::server::AppState;

/// Current request counters and derived rates
pub async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(
        state
            .metrics
            .snapshot(state.selector.total_count(), state.endpoints.names()),
    )
}
