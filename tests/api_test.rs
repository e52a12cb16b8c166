//! HTTP API tests driven through the full router.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use media_vault::activity::ActivityLedger;
use media_vault::config::Config;
use media_vault::db::{
    commit_thread_snapshot, get_links_for_thread, insert_library, insert_performer, insert_video,
    upsert_thread_url, Database, SnapshotLink, SnapshotPost, ThreadSnapshot,
};
use media_vault::downloads::{DownloadManager, Downloads};
use media_vault::hub::Hub;
use media_vault::net::HostLimiter;
use media_vault::scheduler::{Scheduler, WorkerRegistry};
use media_vault::scraper::Scraper;
use media_vault::verifier::Verifier;
use media_vault::web::{create_app, AppState};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const VIDEO_SIZE: usize = 1000;

struct Harness {
    app: Router,
    db: Database,
    temp_dir: TempDir,
}

async fn setup() -> Harness {
    setup_with_manager("http://127.0.0.1:9").await
}

async fn setup_with_manager(manager_url: &str) -> Harness {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db = Database::new(&temp_dir.path().join("test.sqlite"))
        .await
        .expect("Failed to create database");
    let mut config = Config::for_testing();
    config.downloads.manager_url = manager_url.to_string();
    let shutdown = CancellationToken::new();

    let (hub, _) = Hub::start(&config.hub, shutdown.clone());
    let ledger = ActivityLedger::new(db.clone(), hub.clone());
    let limiter = Arc::new(HostLimiter::new(Duration::ZERO));
    let verifier = Verifier::new(
        db.clone(),
        ledger.clone(),
        hub.clone(),
        limiter.clone(),
        config.verifier.clone(),
        shutdown.child_token(),
    )
    .expect("Failed to create verifier");
    let scraper = Scraper::new(
        db.clone(),
        ledger.clone(),
        hub.clone(),
        limiter,
        config.scraper.clone(),
        shutdown.child_token(),
    )
    .await
    .expect("Failed to create scraper");
    let registry = WorkerRegistry::with_defaults(
        db.clone(),
        ledger.clone(),
        scraper.clone(),
        verifier.clone(),
        config.verifier.default_ttl_days,
    );
    // No tick loop: queued jobs stay queued so the tests can inspect them
    let scheduler = Scheduler::new(
        db.clone(),
        hub.clone(),
        registry,
        config.scheduler.clone(),
        shutdown.child_token(),
    );
    let manager = DownloadManager::new(&config.downloads).expect("Failed to create download manager");
    let downloads = Downloads::new(db.clone(), manager);

    let state = AppState {
        db: db.clone(),
        config: Arc::new(config),
        hub,
        ledger,
        scraper,
        verifier,
        scheduler,
        downloads,
    };
    Harness {
        app: create_app(state),
        db,
        temp_dir,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::DELETE)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// ========== Health and envelope ==========

#[tokio::test]
async fn test_health_reports_store_and_hub() {
    let h = setup().await;
    let (status, body) = send(&h.app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["hub"]["running"], true);
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let h = setup().await;
    let response = h.app.clone().oneshot(get("/api/v1/nothing-here")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_json_uses_error_envelope() {
    let h = setup().await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/scraper/threads")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "invalid_argument");
    assert!(body["message"].is_string());
}

// ========== Threads ==========

#[tokio::test]
async fn test_double_submit_creates_one_thread() {
    let h = setup().await;
    let request = json!({ "url": "https://forum.example/threads/jane-doe.42/page-2#post-9" });

    let (status, first) = send(&h.app, post_json("/api/v1/scraper/threads", &request)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(first["success"], true);
    assert_eq!(first["data"]["created"], true);
    assert_eq!(first["data"]["url"], "https://forum.example/threads/jane-doe.42");

    let (status, second) = send(&h.app, post_json("/api/v1/scraper/threads", &request)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(second["data"]["created"], false);
    assert_eq!(first["data"]["thread_id"], second["data"]["thread_id"]);
    assert_ne!(first["data"]["job_id"], second["data"]["job_id"]);

    let (status, listing) = send(&h.app, get("/api/v1/scraper/threads")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listing["pagination"]["total"], 1);
    assert_eq!(listing["data"].as_array().unwrap().len(), 1);

    let (_, jobs) = send(&h.app, get("/api/v1/scheduler/jobs")).await;
    let jobs = jobs["data"].as_array().unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j["job_type"] == "scrape_thread" && j["schedule_type"] == "once"));
}

#[tokio::test]
async fn test_invalid_urls_are_rejected() {
    let h = setup().await;
    for url in ["not a url", "ftp://forum.example/threads/a.1", ""] {
        let (status, body) = send(&h.app, post_json("/api/v1/scraper/threads", &json!({ "url": url }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "url {url:?}");
        assert_eq!(body["error"], "invalid_argument");
    }
}

#[tokio::test]
async fn test_listing_rejects_unknown_sort_and_filter() {
    let h = setup().await;
    let (status, body) = send(&h.app, get("/api/v1/scraper/threads?sort=loudest")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("loudest"));

    let (status, _) = send(&h.app, get("/api/v1/scraper/threads?filter=everything")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&h.app, get("/api/v1/scraper/threads?sort=replies_desc&page=2&limit=5")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pagination"]["page"], 2);
    assert_eq!(body["pagination"]["limit"], 5);
}

#[tokio::test]
async fn test_thread_detail_and_rescrape_of_missing_thread() {
    let h = setup().await;
    let (status, body) = send(&h.app, get("/api/v1/scraper/threads/77")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, _) = send(&h.app, post_json("/api/v1/scraper/threads/77/rescrape", &json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// A scraped thread with one post by `author`.
async fn seed_thread(db: &Database, url: &str, title: &str, author: &str) -> i64 {
    let (thread_id, _) = upsert_thread_url(db.pool(), url).await.unwrap();
    let snapshot = ThreadSnapshot {
        title: Some(title.to_string()),
        posts: vec![SnapshotPost {
            external_post_id: "p1".to_string(),
            author: Some(author.to_string()),
            posted_at: None,
            body: "post".to_string(),
            order_index: 0,
            links: vec![SnapshotLink {
                url: format!("https://gofile.io/d/{thread_id}"),
                provider: "gofile".to_string(),
                filename: None,
            }],
        }],
        ..ThreadSnapshot::default()
    };
    commit_thread_snapshot(db.pool(), thread_id, &snapshot).await.unwrap();
    thread_id
}

#[tokio::test]
async fn test_thread_search() {
    let h = setup().await;
    seed_thread(&h.db, "https://forum.example/threads/a.1", "Jane Doe - Beach Set", "uploader").await;
    seed_thread(&h.db, "https://forum.example/threads/b.2", "Mary Major - Garden", "jane_fan").await;
    seed_thread(&h.db, "https://forum.example/threads/c.3", "Other Stuff", "someone").await;

    // Title or post author, case-insensitive
    let (status, body) = send(&h.app, get("/api/v1/scraper/threads/search?q=JANE")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pagination"]["total"], 2);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    let (_, body) = send(&h.app, get("/api/v1/scraper/threads/search?q=jane&limit=1&page=2")).await;
    assert_eq!(body["pagination"]["total"], 2);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    // Wildcards are literal
    let (_, body) = send(&h.app, get("/api/v1/scraper/threads/search?q=%25")).await;
    assert_eq!(body["pagination"]["total"], 0);

    for uri in ["/api/v1/scraper/threads/search", "/api/v1/scraper/threads/search?q=%20"] {
        let (status, body) = send(&h.app, get(uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(body["error"], "invalid_argument");
    }
}

#[tokio::test]
async fn test_thread_deletion() {
    let h = setup().await;
    let a = seed_thread(&h.db, "https://forum.example/threads/a.1", "A", "x").await;
    let b = seed_thread(&h.db, "https://forum.example/threads/b.2", "B", "x").await;
    let c = seed_thread(&h.db, "https://forum.example/threads/c.3", "C", "x").await;

    // A queued rescrape of a deleted thread goes with it
    let (status, _) = send(&h.app, post_json(&format!("/api/v1/scraper/threads/{a}/rescrape"), &json!({}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = send(&h.app, delete(&format!("/api/v1/scraper/threads/{a}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["deleted"], 1);
    let (status, _) = send(&h.app, get(&format!("/api/v1/scraper/threads/{a}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(get_links_for_thread(h.db.pool(), a).await.unwrap().is_empty());
    let (_, jobs) = send(&h.app, get("/api/v1/scheduler/jobs")).await;
    assert!(jobs["data"].as_array().unwrap().is_empty());

    let (status, _) = send(&h.app, delete(&format!("/api/v1/scraper/threads/{a}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&h.app, post_json("/api/v1/scraper/threads/delete", &json!({ "thread_ids": [] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_argument");
    let (status, body) = send(
        &h.app,
        post_json("/api/v1/scraper/threads/delete", &json!({ "thread_ids": [b, 999] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["deleted"], 1);

    // Deleting everything needs an explicit confirmation
    let (status, _) = send(&h.app, delete("/api/v1/scraper/threads")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (_, listing) = send(&h.app, get("/api/v1/scraper/threads")).await;
    assert_eq!(listing["pagination"]["total"], 1);
    assert_eq!(listing["data"][0]["id"], c);

    let (status, body) = send(&h.app, delete("/api/v1/scraper/threads?confirm=true")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["deleted"], 1);
    let (_, listing) = send(&h.app, get("/api/v1/scraper/threads")).await;
    assert_eq!(listing["pagination"]["total"], 0);
}

#[tokio::test]
async fn test_performer_linking() {
    let h = setup().await;
    let mary = insert_performer(h.db.pool(), "Mary Major").await.unwrap();
    let solo = seed_thread(&h.db, "https://forum.example/threads/a.1", "Jane Doe - Beach Set", "x").await;
    let duo = seed_thread(&h.db, "https://forum.example/threads/b.2", "Jane Doe & Mary Major - Pool", "x").await;

    let (status, body) = send(&h.app, post_json("/api/v1/scraper/threads/auto-link", &json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["threads_scanned"], 2);
    assert_eq!(body["data"]["performers_created"], 1);
    assert_eq!(body["data"]["links_made"], 3);

    // Running it again finds nothing new
    let (_, body) = send(&h.app, post_json("/api/v1/scraper/threads/auto-link", &json!({}))).await;
    assert_eq!(body["data"]["performers_created"], 0);
    assert_eq!(body["data"]["links_made"], 0);

    let jane = insert_performer(h.db.pool(), "Jane Doe").await.unwrap();
    let (status, body) = send(&h.app, get(&format!("/api/v1/scraper/performers/{jane}/threads"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["performer"]["name"], "Jane Doe");
    assert_eq!(body["data"]["threads"].as_array().unwrap().len(), 2);
    let (_, body) = send(&h.app, get(&format!("/api/v1/scraper/performers/{mary}/threads"))).await;
    assert_eq!(body["data"]["threads"][0]["id"], duo);
    let (status, _) = send(&h.app, get("/api/v1/scraper/performers/999/threads")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Manual link with an explicit confidence
    let uri = format!("/api/v1/scraper/threads/{solo}/performers");
    let (status, _) = send(&h.app, post_json(&uri, &json!({ "performer_id": mary, "confidence": 0.5 }))).await;
    assert_eq!(status, StatusCode::OK);
    let (_, detail) = send(&h.app, get(&format!("/api/v1/scraper/threads/{solo}"))).await;
    let performers = detail["data"]["performers"].as_array().unwrap();
    let linked = performers.iter().find(|p| p["performer_id"] == mary).unwrap();
    assert_eq!(linked["confidence"], 0.5);

    let (status, _) = send(&h.app, post_json(&uri, &json!({ "performer_id": mary, "confidence": 1.5 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&h.app, post_json(&uri, &json!({ "performer_id": 999 }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(
        &h.app,
        post_json("/api/v1/scraper/threads/999/performers", &json!({ "performer_id": mary })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ========== Scheduler ==========

#[tokio::test]
async fn test_job_crud() {
    let h = setup().await;
    let (status, body) = send(
        &h.app,
        post_json(
            "/api/v1/scheduler/jobs",
            &json!({
                "job_type": "verify_links",
                "schedule_type": "cron",
                "schedule_config": { "cron": "0 3 * * *" },
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["data"]["id"].as_i64().unwrap();
    assert_eq!(body["data"]["enabled"], true);
    assert!(body["data"]["next_run_at"].is_string());
    assert!(body["data"].get("claim_token").is_none());

    let (status, body) = send(&h.app, post_json(&format!("/api/v1/scheduler/jobs/{id}/toggle"), &json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["enabled"], false);

    let (status, body) = send(&h.app, get(&format!("/api/v1/scheduler/jobs/{id}/history"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 0);

    let delete = Request::builder()
        .method(Method::DELETE)
        .uri(format!("/api/v1/scheduler/jobs/{id}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&h.app, delete).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&h.app, get(&format!("/api/v1/scheduler/jobs/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_job_validation_errors() {
    let h = setup().await;
    let cases = [
        json!({ "job_type": "mine_bitcoin", "schedule_type": "interval", "schedule_config": { "interval_minutes": 5 } }),
        json!({ "job_type": "verify_links", "schedule_type": "cron", "schedule_config": { "cron": "every tuesday" } }),
        json!({ "job_type": "verify_links", "schedule_type": "interval", "schedule_config": {} }),
        json!({ "job_type": "scrape_thread", "schedule_type": "once" }),
    ];
    for case in cases {
        let (status, body) = send(&h.app, post_json("/api/v1/scheduler/jobs", &case)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{case}");
        assert_eq!(body["error"], "invalid_argument");
    }
}

// ========== Downloads ==========

async fn seed_active_link(db: &Database) -> i64 {
    let (thread_id, _) = upsert_thread_url(db.pool(), "https://forum.example/threads/d.4").await.unwrap();
    let snapshot = ThreadSnapshot {
        external_id: Some("4".to_string()),
        title: Some("Downloads".to_string()),
        forum_category: None,
        tags: Vec::new(),
        view_count: None,
        reply_count: None,
        posts: vec![SnapshotPost {
            external_post_id: "p1".to_string(),
            author: None,
            posted_at: None,
            body: "link".to_string(),
            order_index: 0,
            links: vec![SnapshotLink {
                url: "https://pixeldrain.com/u/abc".to_string(),
                provider: "pixeldrain".to_string(),
                filename: Some("abc.mp4".to_string()),
            }],
        }],
        performer_names: Vec::new(),
    };
    commit_thread_snapshot(db.pool(), thread_id, &snapshot).await.unwrap();
    let link = get_links_for_thread(db.pool(), thread_id).await.unwrap().remove(0);
    sqlx::query("UPDATE download_links SET status = 'active' WHERE id = ?")
        .bind(link.id)
        .execute(db.pool())
        .await
        .unwrap();
    link.id
}

#[tokio::test]
async fn test_dispatch_and_mark_downloaded() {
    let manager = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/linkgrabberv2/addLinks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": {} })))
        .expect(1)
        .mount(&manager)
        .await;
    let h = setup_with_manager(&manager.uri()).await;
    let link_id = seed_active_link(&h.db).await;

    let (status, body) = send(
        &h.app,
        post_json(
            "/api/v1/downloads/dispatch",
            &json!({ "link_ids": [link_id, 999], "package_name": "Beach Set" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["dispatched"], json!([link_id]));
    assert_eq!(body["data"]["skipped"][0]["id"], 999);

    let uri = format!("/api/v1/downloads/links/{link_id}/downloaded");
    let (status, _) = send(&h.app, post_json(&uri, &json!({ "path": "/media/abc.mp4" }))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&h.app, post_json(&uri, &json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");

    let (status, _) = send(&h.app, post_json(&format!("/api/v1/downloads/links/{link_id}/reset"), &json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&h.app, post_json(&uri, &json!({}))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_unreachable_manager() {
    let h = setup().await;
    let link_id = seed_active_link(&h.db).await;

    let (status, body) = send(&h.app, get("/api/v1/downloads/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["available"], false);

    let (status, body) = send(
        &h.app,
        post_json("/api/v1/downloads/dispatch", &json!({ "link_ids": [link_id] })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "service_unavailable");

    let (status, _) = send(&h.app, post_json("/api/v1/downloads/dispatch", &json!({ "link_ids": [] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ========== Streaming ==========

fn video_bytes() -> Vec<u8> {
    (0..VIDEO_SIZE).map(|i| (i % 251) as u8).collect()
}

async fn seed_library(h: &Harness) -> (i64, i64) {
    let root = h.temp_dir.path().join("library");
    std::fs::create_dir_all(root.join("clips")).unwrap();
    std::fs::write(root.join("clips/movie.mp4"), video_bytes()).unwrap();
    std::fs::write(h.temp_dir.path().join("secret.txt"), b"outside").unwrap();
    let library_id = insert_library(h.db.pool(), "Main", root.to_str().unwrap()).await.unwrap();
    let video_id = insert_video(h.db.pool(), library_id, "clips/movie.mp4", Some("Movie"), Some(VIDEO_SIZE as i64))
        .await
        .unwrap();
    (library_id, video_id)
}

#[tokio::test]
async fn test_full_stream() {
    let h = setup().await;
    let (_, video_id) = seed_library(&h).await;

    let request = Request::builder()
        .uri(format!("/api/v1/videos/{video_id}/stream"))
        .header(header::ACCEPT_ENCODING, "gzip")
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers[header::CONTENT_TYPE], "video/mp4");
    assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
    assert!(headers.get(header::CONTENT_ENCODING).is_none());
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.as_ref(), video_bytes().as_slice());
}

#[tokio::test]
async fn test_range_stream() {
    let h = setup().await;
    let (library_id, _) = seed_library(&h).await;

    let request = Request::builder()
        .uri(format!("/api/v1/libraries/{library_id}/stream?path=clips/movie.mp4"))
        .header(header::RANGE, "bytes=100-199")
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 100-199/1000");
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "100");
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.as_ref(), &video_bytes()[100..200]);

    // Suffix range
    let request = Request::builder()
        .uri(format!("/api/v1/libraries/{library_id}/stream?path=clips/movie.mp4"))
        .header(header::RANGE, "bytes=-10")
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 990-999/1000");
}

#[tokio::test]
async fn test_unsatisfiable_range() {
    let h = setup().await;
    let (_, video_id) = seed_library(&h).await;

    let request = Request::builder()
        .uri(format!("/api/v1/videos/{video_id}/stream"))
        .header(header::RANGE, "bytes=1000-1100")
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */1000");
}

#[tokio::test]
async fn test_path_traversal_is_forbidden() {
    let h = setup().await;
    let (library_id, _) = seed_library(&h).await;

    for uri in [
        format!("/api/v1/libraries/{library_id}/stream?path=../secret.txt"),
        format!("/api/v1/libraries/{library_id}/stream?path=clips/../../secret.txt"),
        format!("/api/v1/libraries/{library_id}/stream?path=%2e%2e%2fsecret.txt"),
        "/api/v1/videos/%2e%2e/stream".to_string(),
        "/api/v1/videos/..%5csecret/stream".to_string(),
        "/api/v1/libraries/1/../stream".to_string(),
        "/api/v1/scraper/threads/%2E%2E".to_string(),
    ] {
        let (status, body) = send(&h.app, get(&uri)).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{uri}");
        assert_eq!(body["error"], "forbidden_path");
    }
}

#[tokio::test]
async fn test_missing_streams() {
    let h = setup().await;
    let (library_id, _) = seed_library(&h).await;

    let (status, _) = send(&h.app, get("/api/v1/videos/404/stream")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&h.app, get("/api/v1/libraries/404/stream?path=clips/movie.mp4")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&h.app, get(&format!("/api/v1/libraries/{library_id}/stream?path=clips/none.mp4"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&h.app, get(&format!("/api/v1/libraries/{library_id}/stream"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
