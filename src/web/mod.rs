mod activity;
pub mod api;
mod downloads;
mod health;
mod jobs;
mod routes;
mod stream;
mod threads;
mod verification;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::Request;
use axum::http::header::{CONTENT_TYPE, RANGE};
use axum::http::Method;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::compression::predicate::{DefaultPredicate, NotForContentType, Predicate};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::activity::ActivityLedger;
use crate::config::Config;
use crate::db::Database;
use crate::downloads::Downloads;
use crate::hub::Hub;
use crate::scheduler::Scheduler;
use crate::scraper::Scraper;
use crate::verifier::Verifier;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<Config>,
    pub hub: Hub,
    pub ledger: ActivityLedger,
    pub scraper: Scraper,
    pub verifier: Verifier,
    pub scheduler: Scheduler,
    pub downloads: Downloads,
}

/// Start the web server and run until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the address is invalid or the listener cannot bind.
pub async fn serve(state: AppState, shutdown: CancellationToken) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.config.server.host, state.config.server.port)
        .parse()
        .context("Invalid web server address")?;

    let app = create_app(state);

    info!(addr = %addr, "Starting HTTP web server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind web server")?;

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Web server error")?;

    info!("Web server stopped");
    Ok(())
}

/// Create the application router with its middleware stack.
pub fn create_app(state: AppState) -> Router {
    // Video bodies are already compressed and must keep their byte offsets
    let compression = CompressionLayer::new()
        .compress_when(DefaultPredicate::new().and(NotForContentType::new("video/")));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([CONTENT_TYPE, RANGE]);

    Router::new()
        .merge(routes::router())
        .layer(middleware::from_fn(reject_path_traversal))
        .layer(compression)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 403 for any request whose path contains a `..` segment, encoded or not.
async fn reject_path_traversal(request: Request, next: Next) -> Response {
    if has_parent_segment(request.uri().path()) {
        warn!(path = request.uri().path(), "Rejected path traversal");
        return api::ApiError::forbidden_path().into_response();
    }
    next.run(request).await
}

fn has_parent_segment(path: &str) -> bool {
    let decoded = path
        .to_ascii_lowercase()
        .replace("%2e", ".")
        .replace("%2f", "/")
        .replace("%5c", "/")
        .replace('\\', "/");
    decoded.split('/').any(|segment| segment == "..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_segments_detected() {
        assert!(has_parent_segment("/api/v1/libraries/1/../etc"));
        assert!(has_parent_segment("/api/v1/%2e%2e/secret"));
        assert!(has_parent_segment("/api/v1/a%2f..%2fb"));
        assert!(has_parent_segment("/api/v1/a/%2E./b"));
        assert!(!has_parent_segment("/api/v1/videos/3/stream"));
        assert!(!has_parent_segment("/api/v1/files/a..b"));
    }
}
