use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;

use super::api::{self, ApiError, ApiJson, ApiQuery, ApiResult};
use super::AppState;
use crate::db::{ActivityFilter, ActivityStatus};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list))
        .route("/status", get(status))
        .route("/clean", post(clean))
        .route("/:id", get(detail))
        .route("/:id/pause", post(pause))
        .route("/:id/resume", post(resume))
}

async fn list(State(state): State<AppState>, ApiQuery(filter): ApiQuery<ActivityFilter>) -> ApiResult {
    if let Some(status) = filter.status.as_deref() {
        if ActivityStatus::from_str(status).is_none() {
            return Err(ApiError::invalid_argument(format!("Unknown status '{status}'")));
        }
    }
    let activities = state.ledger.query(&filter).await?;
    Ok(api::ok(format!("{} activities", activities.len()), activities))
}

async fn status(State(state): State<AppState>) -> ApiResult {
    Ok(api::ok("Activity status", state.ledger.status().await?))
}

async fn detail(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let activity = state
        .ledger
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Activity {id} not found")))?;
    Ok(api::ok("Activity", activity))
}

async fn pause(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    if !state.ledger.pause(id).await? {
        return Err(not_running(&state, id).await);
    }
    Ok(api::ok("Activity paused", json!({ "id": id, "paused": true })))
}

async fn resume(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    if !state.ledger.resume(id).await? {
        return Err(not_running(&state, id).await);
    }
    Ok(api::ok("Activity resumed", json!({ "id": id, "paused": false })))
}

async fn not_running(state: &AppState, id: i64) -> ApiError {
    match state.ledger.get(id).await {
        Ok(Some(_)) => ApiError::conflict(format!("Activity {id} is not running")),
        Ok(None) => ApiError::not_found(format!("Activity {id} not found")),
        Err(e) => e.into(),
    }
}

#[derive(Debug, Deserialize)]
struct CleanRequest {
    days: i64,
}

async fn clean(State(state): State<AppState>, ApiJson(request): ApiJson<CleanRequest>) -> ApiResult {
    if request.days < 0 {
        return Err(ApiError::invalid_argument("days must not be negative"));
    }
    let deleted = state.ledger.clean_older_than(request.days).await?;
    Ok(api::ok(format!("Deleted {deleted} activities"), json!({ "deleted": deleted })))
}
