use axum::routing::get;
use axum::Router;

use super::{activity, downloads, health, jobs, stream, threads, verification, ws, AppState};

/// Every route, versioned under `/api/v1` except the health probe.
pub fn router() -> Router<AppState> {
    let api = Router::new()
        .nest("/scheduler", jobs::router())
        .nest("/scraper", threads::router())
        .nest("/verification", verification::router())
        .nest("/activity", activity::router())
        .nest("/downloads", downloads::router())
        .route("/ws", get(ws::upgrade))
        .merge(stream::router());

    Router::new()
        .route("/health", get(health::health))
        .nest("/api/v1", api)
}
