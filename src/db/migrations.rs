use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::debug;

/// Forward-only migrations, applied in order and recorded by name.
const MIGRATIONS: &[(&str, &str)] = &[
    ("0001_scheduler_and_activity", MIGRATION_0001),
    ("0002_forum_archive", MIGRATION_0002),
    ("0003_media_library", MIGRATION_0003),
    ("0004_audit_log", MIGRATION_0004),
];

/// Run all pending migrations.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    create_migration_table(pool).await?;

    for &(name, sql) in MIGRATIONS {
        if is_applied(pool, name).await? {
            continue;
        }
        debug!(migration = name, "Applying migration");

        let mut tx = pool.begin().await.context("Failed to begin migration")?;
        sqlx::raw_sql(sql)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Migration {name} failed"))?;
        sqlx::query("INSERT INTO schema_migrations (name) VALUES (?)")
            .bind(name)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to record migration {name}"))?;
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit migration {name}"))?;
    }

    Ok(())
}

async fn create_migration_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create schema_migrations table")?;

    Ok(())
}

async fn is_applied(pool: &SqlitePool, name: &str) -> Result<bool> {
    let row: Option<(String,)> = sqlx::query_as("SELECT name FROM schema_migrations WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("Failed to read schema_migrations")?;
    Ok(row.is_some())
}

/// Names of applied migrations, oldest first.
pub async fn applied(pool: &SqlitePool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT name FROM schema_migrations ORDER BY name ASC")
            .fetch_all(pool)
            .await
            .context("Failed to list migrations")?;
    Ok(rows.into_iter().map(|(n,)| n).collect())
}

const MIGRATION_0001: &str = r"
CREATE TABLE scheduled_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_type TEXT NOT NULL,
    schedule_type TEXT NOT NULL,
    schedule_config TEXT NOT NULL DEFAULT '{}',
    target_type TEXT,
    target_id INTEGER,
    enabled INTEGER NOT NULL DEFAULT 1,
    last_run_at TEXT,
    next_run_at TEXT,
    last_status TEXT,
    last_error TEXT,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    run_count INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    claim_token TEXT,
    claim_expires_at TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX idx_scheduled_jobs_due ON scheduled_jobs(enabled, next_run_at);

CREATE TABLE job_executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL REFERENCES scheduled_jobs(id) ON DELETE CASCADE,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    status TEXT NOT NULL DEFAULT 'running',
    error TEXT,
    stats TEXT,
    duration_ms INTEGER
);

CREATE INDEX idx_job_executions_job ON job_executions(job_id, started_at);

CREATE TABLE activities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_type TEXT NOT NULL,
    label TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    is_paused INTEGER NOT NULL DEFAULT 0,
    progress_current INTEGER NOT NULL DEFAULT 0,
    progress_total INTEGER,
    started_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    finished_at TEXT,
    error TEXT,
    details TEXT
);

CREATE INDEX idx_activities_status ON activities(status, started_at);
CREATE INDEX idx_activities_task_type ON activities(task_type);

CREATE TABLE app_settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
";

const MIGRATION_0002: &str = r"
CREATE TABLE threads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL UNIQUE,
    external_id TEXT,
    title TEXT,
    forum_category TEXT,
    tags TEXT,
    view_count INTEGER,
    reply_count INTEGER,
    first_seen_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    last_scraped_at TEXT,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE posts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    thread_id INTEGER NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
    external_post_id TEXT NOT NULL,
    author TEXT,
    posted_at TEXT,
    body TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    order_index INTEGER NOT NULL,
    first_seen_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    removed_at TEXT,
    UNIQUE(thread_id, external_post_id)
);

CREATE INDEX idx_posts_thread_order ON posts(thread_id, order_index);

CREATE TABLE download_links (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    thread_id INTEGER NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
    post_id INTEGER REFERENCES posts(id) ON DELETE SET NULL,
    url TEXT NOT NULL,
    provider TEXT NOT NULL,
    filename TEXT,
    first_seen_at TEXT NOT NULL,

    status TEXT NOT NULL DEFAULT 'unknown',
    status_version INTEGER NOT NULL DEFAULT 0,
    file_size INTEGER,
    file_type TEXT,
    last_checked_at TEXT,
    check_count INTEGER NOT NULL DEFAULT 0,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    requires_auth INTEGER NOT NULL DEFAULT 0,
    rate_limited_until TEXT,
    last_http_status INTEGER,

    download_status TEXT NOT NULL DEFAULT 'pending',
    downloaded_at TEXT,
    download_path TEXT,
    notes TEXT,

    UNIQUE(thread_id, url)
);

CREATE INDEX idx_download_links_status ON download_links(status);
CREATE INDEX idx_download_links_checked ON download_links(last_checked_at);
CREATE INDEX idx_download_links_provider ON download_links(provider);

CREATE TABLE performers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE COLLATE NOCASE,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE thread_performers (
    thread_id INTEGER NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
    performer_id INTEGER NOT NULL REFERENCES performers(id) ON DELETE CASCADE,
    confidence REAL NOT NULL DEFAULT 1.0,
    PRIMARY KEY (thread_id, performer_id)
);
";

const MIGRATION_0003: &str = r"
CREATE TABLE libraries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    path TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE videos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    library_id INTEGER NOT NULL REFERENCES libraries(id) ON DELETE CASCADE,
    relative_path TEXT NOT NULL,
    title TEXT,
    file_size INTEGER,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    UNIQUE(library_id, relative_path)
);
";

const MIGRATION_0004: &str = r"
CREATE TABLE ai_audit_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX idx_ai_audit_logs_created ON ai_audit_logs(created_at);
";
