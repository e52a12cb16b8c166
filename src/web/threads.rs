use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::api::{self, ApiError, ApiJson, ApiQuery, ApiResult, Pagination};
use super::AppState;
use crate::db::{
    archive_stats, delete_all_threads, delete_threads, get_links_for_thread, get_performer,
    get_posts_for_thread, get_thread, get_thread_performers, link_thread_performer, list_threads,
    list_threads_for_performer, upsert_thread_url, JobKind, ThreadFilter, ThreadQuery, ThreadSort,
};
use crate::scheduler::ScheduleConfig;
use crate::scraper::normalize::clean_thread_url;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/threads", get(list).post(submit).delete(delete_all))
        .route("/threads/search", get(search))
        .route("/threads/delete", post(delete_many))
        .route("/threads/auto-link", post(auto_link))
        .route("/threads/:id", get(detail).delete(delete_one))
        .route("/threads/:id/rescrape", post(rescrape))
        .route("/threads/:id/performers", post(link_performer))
        .route("/performers/:id/threads", get(performer_threads))
        .route("/session", get(session_status).post(set_session))
        .route("/forums", post(scrape_forum))
        .route("/stats", get(stats))
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    url: String,
}

/// Accept an absolute http(s) URL with a host.
fn validate_url(raw: &str) -> Result<String, ApiError> {
    let parsed = url::Url::parse(raw.trim())
        .map_err(|e| ApiError::invalid_argument(format!("Invalid URL: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ApiError::invalid_argument("URL must be http(s) with a host"));
    }
    Ok(clean_thread_url(parsed.as_str()))
}

/// Register the thread (idempotent by URL) and queue a one-shot scrape.
async fn submit(State(state): State<AppState>, ApiJson(request): ApiJson<SubmitRequest>) -> ApiResult {
    let url = validate_url(&request.url)?;
    let (thread_id, created) = upsert_thread_url(state.db.pool(), &url).await?;
    let job = state
        .scheduler
        .enqueue_once(JobKind::ScrapeThread, Some(thread_id), ScheduleConfig::default())
        .await?;
    info!(thread_id, job_id = job.id, created, "Thread scrape queued");
    Ok(api::accepted(
        "Scrape queued",
        json!({ "thread_id": thread_id, "job_id": job.id, "created": created, "url": url }),
    ))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    page: Option<i64>,
    limit: Option<i64>,
    sort: Option<String>,
    provider: Option<String>,
    filter: Option<String>,
}

async fn list(State(state): State<AppState>, ApiQuery(params): ApiQuery<ListParams>) -> ApiResult {
    let sort = match params.sort.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => ThreadSort::from_str(raw)
            .ok_or_else(|| ApiError::invalid_argument(format!("Unknown sort '{raw}'")))?,
        None => ThreadSort::default(),
    };
    let filter = match params.filter.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            ThreadFilter::from_str(raw)
                .ok_or_else(|| ApiError::invalid_argument(format!("Unknown filter '{raw}'")))?,
        ),
        None => None,
    };
    let query = ThreadQuery {
        page: params.page.unwrap_or(1).max(1),
        limit: params.limit.unwrap_or(20).clamp(1, 200),
        sort,
        provider: params.provider.filter(|p| !p.is_empty()),
        filter,
        search: None,
    };

    let (threads, total) = list_threads(state.db.pool(), &query).await?;
    Ok(api::paginated(
        format!("{} threads", threads.len()),
        threads,
        Pagination::new(query.page, query.limit, total),
    ))
}

async fn detail(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let pool = state.db.pool();
    let thread = get_thread(pool, id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Thread {id} not found")))?;
    let posts = get_posts_for_thread(pool, id).await?;
    let links = get_links_for_thread(pool, id).await?;
    let performers = get_thread_performers(pool, id).await?;

    Ok(api::ok(
        "Thread",
        json!({ "thread": thread, "posts": posts, "links": links, "performers": performers }),
    ))
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: Option<String>,
    page: Option<i64>,
    limit: Option<i64>,
}

/// Threads whose title or post authors contain `q`, newest scrape first.
async fn search(State(state): State<AppState>, ApiQuery(params): ApiQuery<SearchParams>) -> ApiResult {
    let needle = params
        .q
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::invalid_argument("Search query 'q' is required"))?;
    let query = ThreadQuery {
        page: params.page.unwrap_or(1).max(1),
        limit: params.limit.unwrap_or(20).clamp(1, 200),
        sort: ThreadSort::DateDesc,
        search: Some(needle),
        ..ThreadQuery::default()
    };
    let (threads, total) = list_threads(state.db.pool(), &query).await?;
    Ok(api::paginated(
        format!("{total} matching threads"),
        threads,
        Pagination::new(query.page, query.limit, total),
    ))
}

async fn delete_one(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    if delete_threads(state.db.pool(), &[id]).await? == 0 {
        return Err(ApiError::not_found(format!("Thread {id} not found")));
    }
    info!(thread_id = id, "Thread deleted");
    Ok(api::ok("Thread deleted", json!({ "deleted": 1 })))
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    thread_ids: Vec<i64>,
}

async fn delete_many(State(state): State<AppState>, ApiJson(request): ApiJson<DeleteRequest>) -> ApiResult {
    if request.thread_ids.is_empty() {
        return Err(ApiError::invalid_argument("thread_ids must not be empty"));
    }
    let deleted = delete_threads(state.db.pool(), &request.thread_ids).await?;
    info!(requested = request.thread_ids.len(), deleted, "Threads deleted");
    Ok(api::ok(format!("Deleted {deleted} threads"), json!({ "deleted": deleted })))
}

#[derive(Debug, Deserialize)]
struct DeleteAllParams {
    #[serde(default)]
    confirm: bool,
}

async fn delete_all(State(state): State<AppState>, ApiQuery(params): ApiQuery<DeleteAllParams>) -> ApiResult {
    if !params.confirm {
        return Err(ApiError::invalid_argument("Pass confirm=true to delete every thread"));
    }
    let deleted = delete_all_threads(state.db.pool()).await?;
    warn!(deleted, "All threads deleted");
    Ok(api::ok(format!("Deleted {deleted} threads"), json!({ "deleted": deleted })))
}

#[derive(Debug, Deserialize)]
struct LinkPerformerRequest {
    performer_id: i64,
    confidence: Option<f64>,
}

async fn link_performer(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ApiJson(request): ApiJson<LinkPerformerRequest>,
) -> ApiResult {
    let confidence = request.confidence.unwrap_or(1.0);
    if !(confidence > 0.0 && confidence <= 1.0) {
        return Err(ApiError::invalid_argument("confidence must be in (0, 1]"));
    }
    let pool = state.db.pool();
    if get_thread(pool, id).await?.is_none() {
        return Err(ApiError::not_found(format!("Thread {id} not found")));
    }
    let performer = get_performer(pool, request.performer_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Performer {} not found", request.performer_id)))?;
    link_thread_performer(pool, id, performer.id, confidence).await?;
    Ok(api::ok(
        "Thread linked to performer",
        json!({ "thread_id": id, "performer": performer, "confidence": confidence }),
    ))
}

async fn auto_link(State(state): State<AppState>) -> ApiResult {
    let stats = state.scraper.auto_link_performers().await?;
    Ok(api::ok("Threads linked to performers", stats))
}

async fn performer_threads(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let pool = state.db.pool();
    let performer = get_performer(pool, id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Performer {id} not found")))?;
    let threads = list_threads_for_performer(pool, id).await?;
    Ok(api::ok(
        format!("{} threads", threads.len()),
        json!({ "performer": performer, "threads": threads }),
    ))
}

async fn rescrape(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    if get_thread(state.db.pool(), id).await?.is_none() {
        return Err(ApiError::not_found(format!("Thread {id} not found")));
    }
    let job = state
        .scheduler
        .enqueue_once(JobKind::ScrapeThread, Some(id), ScheduleConfig::default())
        .await?;
    Ok(api::accepted("Rescrape queued", json!({ "thread_id": id, "job_id": job.id })))
}

async fn session_status(State(state): State<AppState>) -> ApiResult {
    let configured = state.scraper.has_session().await;
    Ok(api::ok(
        if configured { "Session configured" } else { "No session configured" },
        json!({ "configured": configured }),
    ))
}

#[derive(Debug, Deserialize)]
struct SessionRequest {
    cookie: String,
}

async fn set_session(State(state): State<AppState>, ApiJson(request): ApiJson<SessionRequest>) -> ApiResult {
    state.scraper.set_session(&request.cookie).await?;
    let configured = state.scraper.has_session().await;
    Ok(api::ok("Session updated", json!({ "configured": configured })))
}

#[derive(Debug, Deserialize)]
struct ForumRequest {
    url: String,
    max_threads: Option<usize>,
}

async fn scrape_forum(State(state): State<AppState>, ApiJson(request): ApiJson<ForumRequest>) -> ApiResult {
    let url = validate_url(&request.url)?;
    if request.max_threads == Some(0) {
        return Err(ApiError::invalid_argument("max_threads must be positive"));
    }
    state.scraper.spawn_forum_scrape(url.clone(), request.max_threads);
    Ok(api::accepted(
        "Forum scrape started",
        json!({ "url": url, "max_threads": request.max_threads }),
    ))
}

async fn stats(State(state): State<AppState>) -> ApiResult {
    Ok(api::ok("Scraper stats", archive_stats(state.db.pool()).await?))
}
