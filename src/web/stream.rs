use std::path::Path as FsPath;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use super::api::{ApiError, ApiQuery, ApiResult};
use super::AppState;
use crate::db::{get_library, get_video_with_library};
use crate::streaming::{resolve_in_library, serve_file};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/libraries/:id/stream", get(stream_library_file))
        .route("/videos/:id/stream", get(stream_video))
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    path: Option<String>,
}

fn range_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::RANGE).and_then(|v| v.to_str().ok())
}

async fn stream_library_file(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ApiQuery(params): ApiQuery<StreamParams>,
    headers: HeaderMap,
) -> ApiResult {
    let relative = params
        .path
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::invalid_argument("Missing path parameter"))?;
    let library = get_library(state.db.pool(), id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Library {id} not found")))?;

    let full = resolve_in_library(FsPath::new(&library.path), &relative).await?;
    Ok(serve_file(&full, range_header(&headers)).await?)
}

async fn stream_video(State(state): State<AppState>, Path(id): Path<i64>, headers: HeaderMap) -> ApiResult {
    let (video, library) = get_video_with_library(state.db.pool(), id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Video {id} not found")))?;

    let full = resolve_in_library(FsPath::new(&library.path), &video.relative_path).await?;
    Ok(serve_file(&full, range_header(&headers)).await?)
}
