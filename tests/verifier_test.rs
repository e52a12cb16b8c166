//! Link verification against a mock file host.

use std::sync::Arc;
use std::time::Duration;

use media_vault::activity::ActivityLedger;
use media_vault::config::{Config, VerifierConfig};
use media_vault::db::{
    commit_thread_snapshot, get_links_for_thread, list_activities, upsert_thread_url,
    ActivityFilter, Database, DownloadLink, SnapshotLink, SnapshotPost, ThreadSnapshot,
};
use media_vault::hub::Hub;
use media_vault::net::HostLimiter;
use media_vault::verifier::Verifier;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    db: Database,
    verifier: Verifier,
    thread_id: i64,
    _temp_dir: TempDir,
}

/// A thread whose links point at `paths` on the mock server.
async fn setup(server: &MockServer, paths: &[&str], config: VerifierConfig) -> Harness {
    let urls = paths.iter().map(|p| format!("{}{p}", server.uri())).collect();
    setup_with_urls(urls, config).await
}

async fn setup_with_urls(urls: Vec<String>, config: VerifierConfig) -> Harness {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db = Database::new(&temp_dir.path().join("test.sqlite"))
        .await
        .expect("Failed to create database");
    let (hub, _) = Hub::start(&Config::for_testing().hub, CancellationToken::new());
    let ledger = ActivityLedger::new(db.clone(), hub.clone());
    let verifier = Verifier::new(
        db.clone(),
        ledger,
        hub,
        Arc::new(HostLimiter::new(Duration::ZERO)),
        config,
        CancellationToken::new(),
    )
    .expect("Failed to create verifier");

    let (thread_id, _) = upsert_thread_url(db.pool(), "https://forum.example/threads/links.9")
        .await
        .unwrap();
    let snapshot = ThreadSnapshot {
        posts: vec![SnapshotPost {
            external_post_id: "1".to_string(),
            author: None,
            posted_at: None,
            body: "links".to_string(),
            order_index: 0,
            links: urls
                .into_iter()
                .map(|url| SnapshotLink {
                    url,
                    provider: "pixeldrain".to_string(),
                    filename: None,
                })
                .collect(),
        }],
        ..ThreadSnapshot::default()
    };
    commit_thread_snapshot(db.pool(), thread_id, &snapshot).await.unwrap();

    Harness {
        db,
        verifier,
        thread_id,
        _temp_dir: temp_dir,
    }
}

fn test_config() -> VerifierConfig {
    Config::for_testing().verifier
}

async fn link_at(h: &Harness, suffix: &str) -> DownloadLink {
    get_links_for_thread(h.db.pool(), h.thread_id)
        .await
        .unwrap()
        .into_iter()
        .find(|l| l.url.ends_with(suffix))
        .expect("link missing")
}

#[tokio::test]
async fn test_statuses_follow_probe_responses() {
    let server = MockServer::start().await;
    Mock::given(path("/u/alive"))
        .respond_with(ResponseTemplate::new(200).insert_header("content-type", "video/mp4"))
        .mount(&server)
        .await;
    Mock::given(path("/u/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(path("/u/throttled"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .mount(&server)
        .await;
    Mock::given(path("/u/private"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let h = setup(&server, &["/u/alive", "/u/gone", "/u/throttled", "/u/private"], test_config()).await;
    let report = h
        .verifier
        .verify_thread(h.thread_id, &CancellationToken::new())
        .await
        .expect("verification failed");

    assert_eq!(report.checked, 4);
    assert_eq!(report.active, 2);
    assert_eq!(report.dead, 1);
    assert_eq!(report.rate_limited, 1);

    let alive = link_at(&h, "/u/alive").await;
    assert_eq!(alive.status, "active");
    assert_eq!(alive.file_type.as_deref(), Some("video/mp4"));
    assert_eq!(alive.check_count, 1);
    assert!(alive.last_checked_at.is_some());

    assert_eq!(link_at(&h, "/u/gone").await.status, "dead");

    let throttled = link_at(&h, "/u/throttled").await;
    assert_eq!(throttled.status, "rate_limited");
    assert_eq!(throttled.consecutive_failures, 0);
    assert!(throttled.rate_limited_until.is_some());

    let private = link_at(&h, "/u/private").await;
    assert_eq!(private.status, "active");
    assert!(private.requires_auth);

    let counts = h.verifier.thread_counts(h.thread_id).await.unwrap();
    assert_eq!(counts.total, 4);
    assert_eq!(counts.active, 2);

    let stats = h.verifier.stats();
    assert_eq!(stats.total_checked, 4);
    assert_eq!(stats.in_flight, 0);
    assert!(stats.last_check_at.is_some());
}

#[tokio::test]
async fn test_server_errors_reach_failure_threshold() {
    let server = MockServer::start().await;
    Mock::given(path("/u/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let config = VerifierConfig {
        failure_threshold: 3,
        ..test_config()
    };
    let h = setup(&server, &["/u/flaky"], config).await;
    let cancel = CancellationToken::new();

    for expected_failures in 1..=2 {
        let report = h.verifier.verify_thread(h.thread_id, &cancel).await.unwrap();
        assert_eq!(report.unchanged, 1);
        let link = link_at(&h, "/u/flaky").await;
        assert_eq!(link.status, "unknown");
        assert_eq!(link.consecutive_failures, expected_failures);
    }

    let report = h.verifier.verify_thread(h.thread_id, &cancel).await.unwrap();
    assert_eq!(report.dead, 1);
    let link = link_at(&h, "/u/flaky").await;
    assert_eq!(link.status, "dead");
    assert_eq!(link.consecutive_failures, 3);
}

#[tokio::test]
async fn test_success_resets_failures() {
    let server = MockServer::start().await;
    Mock::given(path("/u/recovering"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(path("/u/recovering"))
        .respond_with(ResponseTemplate::new(200).insert_header("content-type", "application/zip"))
        .mount(&server)
        .await;

    let h = setup(&server, &["/u/recovering"], test_config()).await;
    let cancel = CancellationToken::new();
    h.verifier.verify_thread(h.thread_id, &cancel).await.unwrap();
    assert_eq!(link_at(&h, "/u/recovering").await.consecutive_failures, 1);

    h.verifier.verify_thread(h.thread_id, &cancel).await.unwrap();
    let link = link_at(&h, "/u/recovering").await;
    assert_eq!(link.status, "active");
    assert_eq!(link.consecutive_failures, 0);
    assert_eq!(link.check_count, 2);
}

#[tokio::test]
async fn test_provider_health_tracks_outcomes() {
    let server = MockServer::start().await;
    Mock::given(path("/u/ok"))
        .respond_with(ResponseTemplate::new(200).insert_header("content-type", "video/mp4"))
        .mount(&server)
        .await;
    Mock::given(path("/u/missing"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let h = setup(&server, &["/u/ok", "/u/missing"], test_config()).await;
    assert!(h.verifier.provider_health(Some("pixeldrain")).is_empty());

    h.verifier
        .verify_thread(h.thread_id, &CancellationToken::new())
        .await
        .unwrap();

    let health = h.verifier.provider_health(Some("pixeldrain"));
    assert_eq!(health.len(), 1);
    assert_eq!(health[0].active, 1);
    assert_eq!(health[0].dead, 1);
    assert!((health[0].score - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_stale_sweep_skips_recent_checks() {
    let server = MockServer::start().await;
    Mock::given(path("/u/file"))
        .respond_with(ResponseTemplate::new(200).insert_header("content-type", "video/mp4"))
        .mount(&server)
        .await;

    let h = setup(&server, &["/u/file"], test_config()).await;
    let cancel = CancellationToken::new();

    let first = h.verifier.verify_stale(7, 100, &cancel).await.unwrap();
    assert_eq!(first.checked, 1);
    let second = h.verifier.verify_stale(7, 100, &cancel).await.unwrap();
    assert_eq!(second.checked, 0);
}

#[tokio::test]
async fn test_throttled_host_does_not_hold_workers() {
    let server = MockServer::start().await;
    Mock::given(path_regex("^/u/busy"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(path("/u/elsewhere"))
        .respond_with(ResponseTemplate::new(200).insert_header("content-type", "video/mp4"))
        .mount(&server)
        .await;

    // Same server under a second host name
    let port = server.address().port();
    let mut urls: Vec<String> = (1..=4).map(|i| format!("{}/u/busy{i}", server.uri())).collect();
    urls.push(format!("http://localhost:{port}/u/elsewhere"));
    let config = VerifierConfig {
        worker_count: 2,
        ..test_config()
    };
    let h = setup_with_urls(urls, config).await;

    let start = std::time::Instant::now();
    let report = h
        .verifier
        .verify_thread(h.thread_id, &CancellationToken::new())
        .await
        .unwrap();
    assert!(start.elapsed() < Duration::from_millis(2500));
    assert_eq!(report.rate_limited, 4);
    assert_eq!(report.active, 1);

    for i in 1..=4 {
        let link = link_at(&h, &format!("/u/busy{i}")).await;
        assert_eq!(link.status, "rate_limited");
        assert!(link.rate_limited_until.is_some());
    }
    assert_eq!(link_at(&h, "/u/elsewhere").await.status, "active");

    // Only the contacted link counts towards provider health
    let health = h.verifier.provider_health(Some("pixeldrain"));
    assert_eq!(health[0].samples, 2);
}

#[tokio::test]
async fn test_stale_sweep_leaves_dead_links_until_ttl() {
    let server = MockServer::start().await;
    Mock::given(path("/u/down"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let config = VerifierConfig {
        failure_threshold: 1,
        ..test_config()
    };
    let h = setup(&server, &["/u/down"], config).await;
    let cancel = CancellationToken::new();

    let first = h.verifier.verify_stale(7, 100, &cancel).await.unwrap();
    assert_eq!(first.dead, 1);
    let link = link_at(&h, "/u/down").await;
    assert_eq!(link.status, "dead");
    assert_eq!(link.consecutive_failures, 1);

    for _ in 0..3 {
        let again = h.verifier.verify_stale(7, 100, &cancel).await.unwrap();
        assert_eq!(again.checked, 0);
    }
}

#[tokio::test]
async fn test_batch_finishes_when_progress_writes_fail() {
    let server = MockServer::start().await;
    Mock::given(path_regex("^/u/ok"))
        .respond_with(ResponseTemplate::new(200).insert_header("content-type", "video/mp4"))
        .mount(&server)
        .await;

    let h = setup(&server, &["/u/ok1", "/u/ok2", "/u/ok3"], test_config()).await;
    sqlx::query(
        "CREATE TRIGGER reject_progress BEFORE UPDATE OF progress_current ON activities \
         BEGIN SELECT RAISE(ABORT, 'disk full'); END",
    )
    .execute(h.db.pool())
    .await
    .unwrap();

    let report = h
        .verifier
        .verify_thread(h.thread_id, &CancellationToken::new())
        .await
        .expect("progress failures must not abort the batch");
    assert_eq!(report.active, 3);
    assert_eq!(link_at(&h, "/u/ok3").await.status, "active");

    let activities = list_activities(
        h.db.pool(),
        &ActivityFilter {
            status: None,
            task_type: Some("verify_links".to_string()),
            limit: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(activities.len(), 1);
    assert_eq!(activities[0].status, "completed");
}
