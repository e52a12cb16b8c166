mod migrations;
mod models;
mod queries;

pub use migrations::applied as applied_migrations;
pub use models::*;
pub use queries::*;

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

/// Timestamp layout shared by Rust and SQL (`strftime('%Y-%m-%dT%H:%M:%fZ')`).
///
/// Fixed width, so text comparison orders correctly.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Format an instant the way the store persists it.
#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Current instant in store format.
#[must_use]
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Parse a stored timestamp.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Connection pool health, reported by `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub open: u32,
    pub idle: usize,
    pub in_use: usize,
    pub wait_ms: u64,
    pub ping_ok: bool,
}

impl Database {
    /// Open (or create) the store at `path`, running migrations if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or migrations fail.
    pub async fn new(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // The scheduler, verifier and HTTP handlers all write concurrently;
            // WAL still serializes writers, so wait instead of failing with SQLITE_BUSY.
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        let db = Self { pool };
        db.run_migrations().await?;
        db.verify_writable(path).await?;

        Ok(db)
    }

    async fn verify_writable(&self, path: &Path) -> Result<()> {
        // A read-only volume otherwise surfaces much later as
        // "attempt to write a readonly database".
        let tx = self.pool.begin().await.with_context(|| {
            format!(
                "SQLite database is not writable (path: {}). Check volume permissions",
                path.display()
            )
        })?;

        tx.commit()
            .await
            .context("Failed to commit SQLite writability check")?;
        Ok(())
    }

    async fn run_migrations(&self) -> Result<()> {
        migrations::run(&self.pool).await?;
        info!("Database migrations complete");
        Ok(())
    }

    /// Get a reference to the connection pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Ping the store and report pool utilisation.
    ///
    /// `wait_ms` covers acquiring a connection and running the ping.
    pub async fn health(&self) -> PoolHealth {
        let started = Instant::now();
        let ping_ok = sqlx::query("SELECT 1").execute(&self.pool).await.is_ok();
        let wait_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let open = self.pool.size();
        let idle = self.pool.num_idle();
        PoolHealth {
            open,
            idle,
            in_use: (open as usize).saturating_sub(idle),
            wait_ms,
            ping_ok,
        }
    }

    /// Close the pool, waiting for checked-out connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
