use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use media_vault::activity::ActivityLedger;
use media_vault::config::{Config, ServerMode};
use media_vault::db::{fail_interrupted_activities, Database};
use media_vault::downloads::{DownloadManager, Downloads};
use media_vault::hub::Hub;
use media_vault::net::HostLimiter;
use media_vault::scheduler::{Scheduler, WorkerRegistry};
use media_vault::scraper::Scraper;
use media_vault::verifier::Verifier;
use media_vault::web::{self, AppState};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

#[allow(clippy::too_many_lines)]
async fn run() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(config.server.mode)?;
    config.validate().context("Invalid configuration")?;

    info!(
        mode = ?config.server.mode,
        store = %config.paths.store_url,
        assets = %config.paths.assets_dir.display(),
        "Starting media-vault"
    );

    let store_path = config.paths.store_path();
    if let Some(parent) = store_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create store directory: {}", parent.display()))?;
    }

    let db = Database::new(&store_path)
        .await
        .context("Failed to initialize database")?;
    info!("Database initialized");

    let interrupted = fail_interrupted_activities(db.pool()).await?;
    if interrupted > 0 {
        warn!(count = interrupted, "Marked activities interrupted by the last shutdown as failed");
    }

    let shutdown = CancellationToken::new();

    // The hub outlives the workers so their final events still go out
    let hub_shutdown = CancellationToken::new();
    let (hub, hub_handle) = Hub::start(&config.hub, hub_shutdown.clone());
    let ledger = ActivityLedger::new(db.clone(), hub.clone());

    let mut limiter = HostLimiter::new(Duration::from_millis(config.scraper.per_origin_spacing_ms));
    for (host, spacing_ms) in &config.scraper.origin_spacing_ms {
        limiter = limiter.with_override(host, Duration::from_millis(*spacing_ms));
    }
    let limiter = Arc::new(limiter);

    let verifier = Verifier::new(
        db.clone(),
        ledger.clone(),
        hub.clone(),
        limiter.clone(),
        config.verifier.clone(),
        shutdown.child_token(),
    )?;
    let verifier_handle = verifier.start();

    let scraper = Scraper::new(
        db.clone(),
        ledger.clone(),
        hub.clone(),
        limiter,
        config.scraper.clone(),
        shutdown.child_token(),
    )
    .await?;

    let registry = WorkerRegistry::with_defaults(
        db.clone(),
        ledger.clone(),
        scraper.clone(),
        verifier.clone(),
        config.verifier.default_ttl_days,
    );
    let scheduler = Scheduler::new(
        db.clone(),
        hub.clone(),
        registry,
        config.scheduler.clone(),
        shutdown.child_token(),
    );
    let scheduler_handle = scheduler.start();
    info!("Scheduler started");

    let manager = DownloadManager::new(&config.downloads)?;
    let downloads = Downloads::new(db.clone(), manager);

    let state = AppState {
        db: db.clone(),
        config: Arc::new(config),
        hub,
        ledger,
        scraper: scraper.clone(),
        verifier: verifier.clone(),
        scheduler: scheduler.clone(),
        downloads,
    };

    let web_shutdown = shutdown.clone();
    let web_handle = tokio::spawn(async move {
        if let Err(e) = web::serve(state, web_shutdown).await {
            error!("Web server error: {e:#}");
        }
    });

    tokio::select! {
        () = shutdown_signal() => {},
        () = shutdown.cancelled() => {},
    }

    info!("Shutting down...");
    shutdown.cancel();

    scheduler.stop().await;
    let _ = scheduler_handle.await;
    scraper.drain().await;
    let _ = verifier_handle.await;
    // Closing the hub ends open live sockets, which lets the server finish
    hub_shutdown.cancel();
    let _ = hub_handle.await;
    if tokio::time::timeout(Duration::from_secs(5), web_handle).await.is_err() {
        warn!("Web server did not stop in time");
    }
    db.close().await;

    info!("Shutdown complete");

    Ok(())
}

fn init_tracing(mode: ServerMode) -> Result<()> {
    let default_filter = match mode {
        ServerMode::Debug => "debug",
        ServerMode::Release => "info,media_vault=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // Check if JSON logging is requested
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
