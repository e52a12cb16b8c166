use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::AppState;

/// Liveness plus a store ping. 503 when the store does not answer.
pub async fn health(State(state): State<AppState>) -> Response {
    let database = state.db.health().await;
    let observers = state.hub.observer_count().await.ok();
    let healthy = database.ping_ok && observers.is_some();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "success": healthy,
            "message": if healthy { "ok" } else { "degraded" },
            "data": {
                "database": database,
                "hub": { "running": observers.is_some(), "observers": observers },
                "verifier": state.verifier.stats(),
            },
        })),
    )
        .into_response()
}
