use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;

use super::api::{self, ApiError, ApiJson, ApiResult};
use super::AppState;
use crate::downloads::MarkOutcome;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/dispatch", post(dispatch))
        .route("/links/:id/downloaded", post(mark_downloaded))
        .route("/links/:id/failed", post(mark_failed))
        .route("/links/:id/reset", post(reset))
}

async fn status(State(state): State<AppState>) -> ApiResult {
    let manager = state.downloads.manager();
    let version = manager.version().await;
    Ok(api::ok(
        if version.is_some() { "Download manager available" } else { "Download manager unavailable" },
        json!({ "available": version.is_some(), "version": version, "url": manager.base_url() }),
    ))
}

#[derive(Debug, Deserialize)]
struct DispatchRequest {
    link_ids: Vec<i64>,
    package_name: Option<String>,
}

async fn dispatch(State(state): State<AppState>, ApiJson(request): ApiJson<DispatchRequest>) -> ApiResult {
    if request.link_ids.is_empty() {
        return Err(ApiError::invalid_argument("link_ids must not be empty"));
    }
    let report = state
        .downloads
        .dispatch(&request.link_ids, request.package_name.as_deref())
        .await?;
    Ok(api::ok(format!("Dispatched {} links", report.dispatched.len()), report))
}

#[derive(Debug, Default, Deserialize)]
struct MarkRequest {
    path: Option<String>,
    notes: Option<String>,
}

fn outcome(id: i64, outcome: MarkOutcome, message: &str) -> ApiResult {
    match outcome {
        MarkOutcome::Updated => Ok(api::ok(message, json!({ "id": id }))),
        MarkOutcome::AlreadyDownloaded => Err(ApiError::conflict(format!(
            "Link {id} is already downloaded; reset it first"
        ))),
        MarkOutcome::NotFound => Err(ApiError::not_found(format!("Link {id} not found"))),
    }
}

async fn mark_downloaded(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Option<ApiJson<MarkRequest>>,
) -> ApiResult {
    let request = body.map(|ApiJson(r)| r).unwrap_or_default();
    let result = state
        .downloads
        .mark_downloaded(id, request.path.as_deref(), request.notes.as_deref())
        .await?;
    outcome(id, result, "Link marked downloaded")
}

async fn mark_failed(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Option<ApiJson<MarkRequest>>,
) -> ApiResult {
    let request = body.map(|ApiJson(r)| r).unwrap_or_default();
    let result = state.downloads.mark_failed(id, request.notes.as_deref()).await?;
    outcome(id, result, "Link marked failed")
}

async fn reset(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let result = state.downloads.reset(id).await?;
    outcome(id, result, "Link reset to pending")
}
