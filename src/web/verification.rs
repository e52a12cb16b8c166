use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;

use super::api::{self, ApiError, ApiQuery, ApiResult};
use super::AppState;
use crate::db::{get_thread, JobKind};
use crate::scheduler::ScheduleConfig;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/threads/:id", post(verify_thread).get(thread_counts))
        .route("/stale", post(verify_stale))
        .route("/providers", get(providers))
        .route("/stats", get(stats))
}

async fn verify_thread(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    if get_thread(state.db.pool(), id).await?.is_none() {
        return Err(ApiError::not_found(format!("Thread {id} not found")));
    }
    let job = state
        .scheduler
        .enqueue_once(JobKind::VerifyLinks, Some(id), ScheduleConfig::default())
        .await?;
    Ok(api::accepted("Verification queued", json!({ "thread_id": id, "job_id": job.id })))
}

#[derive(Debug, Deserialize)]
struct StaleParams {
    limit: Option<i64>,
    cutoff_days: Option<i64>,
}

async fn verify_stale(State(state): State<AppState>, ApiQuery(params): ApiQuery<StaleParams>) -> ApiResult {
    if params.limit.is_some_and(|l| l <= 0) {
        return Err(ApiError::invalid_argument("limit must be positive"));
    }
    if params.cutoff_days.is_some_and(|d| d < 0) {
        return Err(ApiError::invalid_argument("cutoff_days must not be negative"));
    }
    let config = ScheduleConfig {
        limit: params.limit,
        cutoff_days: params.cutoff_days,
        ..ScheduleConfig::default()
    };
    let job = state
        .scheduler
        .enqueue_once(JobKind::VerifyLinks, None, config)
        .await?;
    Ok(api::accepted(
        "Stale verification queued",
        json!({
            "job_id": job.id,
            "limit": params.limit,
            "cutoff_days": params.cutoff_days.unwrap_or(state.config.verifier.default_ttl_days),
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct ProviderParams {
    provider: Option<String>,
}

async fn providers(State(state): State<AppState>, ApiQuery(params): ApiQuery<ProviderParams>) -> ApiResult {
    let health = state.verifier.provider_health(params.provider.as_deref());
    Ok(api::ok(format!("{} providers", health.len()), health))
}

async fn stats(State(state): State<AppState>) -> ApiResult {
    Ok(api::ok("Verification stats", state.verifier.stats()))
}

async fn thread_counts(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    if get_thread(state.db.pool(), id).await?.is_none() {
        return Err(ApiError::not_found(format!("Thread {id} not found")));
    }
    Ok(api::ok("Thread link status", state.verifier.thread_counts(id).await?))
}
