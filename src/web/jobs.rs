use axum::extract::{Path, State};
use axum::routing::{get, post, put};
use axum::Router;
use serde::Deserialize;

use super::api::{self, ApiJson, ApiQuery, ApiResult};
use super::AppState;
use crate::scheduler::{JobPatch, JobRequest};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/:id", put(update_job).get(get_job).delete(delete_job))
        .route("/jobs/:id/toggle", post(toggle_job))
        .route("/jobs/:id/history", get(history))
}

async fn list_jobs(State(state): State<AppState>) -> ApiResult {
    let jobs = state.scheduler.jobs().await?;
    Ok(api::ok(format!("{} jobs", jobs.len()), jobs))
}

async fn create_job(State(state): State<AppState>, ApiJson(request): ApiJson<JobRequest>) -> ApiResult {
    let job = state.scheduler.create_job(request).await?;
    Ok(api::created("Job created", job))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    Ok(api::ok("Job", state.scheduler.job(id).await?))
}

async fn update_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ApiJson(patch): ApiJson<JobPatch>,
) -> ApiResult {
    let job = state.scheduler.update_job(id, patch).await?;
    Ok(api::ok("Job updated", job))
}

async fn toggle_job(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let job = state.scheduler.toggle_job(id).await?;
    let message = if job.enabled { "Job enabled" } else { "Job disabled" };
    Ok(api::ok(message, job))
}

async fn delete_job(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    state.scheduler.delete_job(id).await?;
    Ok(api::ok("Job deleted", serde_json::json!({ "id": id })))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<i64>,
}

async fn history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ApiQuery(params): ApiQuery<HistoryParams>,
) -> ApiResult {
    let executions = state.scheduler.history(id, params.limit.unwrap_or(20)).await?;
    Ok(api::ok(format!("{} executions", executions.len()), executions))
}
