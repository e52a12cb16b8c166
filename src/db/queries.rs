use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use super::models::{
    Activity, ActivityFilter, ArchiveStats, DownloadLink, JobExecution, JobRunOutcome, Library,
    LinkCheckUpdate, LinkStatusCounts, NewJob, Performer, Post, ProviderCount, RunStatus, ScheduledJob,
    SnapshotStats, Thread, ThreadFilter, ThreadPerformer, ThreadQuery, ThreadSnapshot,
    ThreadSummary, Video,
};
use super::now_timestamp;
use crate::constants::TITLE_MATCH_CONFIDENCE;

/// Hex SHA-256 of a post body, used to detect edits between scrapes.
#[must_use]
pub fn content_hash(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

// ========== Settings ==========

/// Read an application setting.
pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM app_settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("Failed to read setting")?;
    Ok(row.map(|(v,)| v))
}

/// Insert or replace an application setting.
pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO app_settings (key, value, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        ",
    )
    .bind(key)
    .bind(value)
    .bind(now_timestamp())
    .execute(pool)
    .await
    .context("Failed to write setting")?;
    Ok(())
}

// ========== Scheduled jobs ==========

/// Insert a scheduled job, returning its ID.
pub async fn insert_job(pool: &SqlitePool, job: &NewJob) -> Result<i64> {
    let result = sqlx::query(
        r"
        INSERT INTO scheduled_jobs
            (job_type, schedule_type, schedule_config, target_type, target_id, enabled, next_run_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(&job.job_type)
    .bind(&job.schedule_type)
    .bind(&job.schedule_config)
    .bind(&job.target_type)
    .bind(job.target_id)
    .bind(job.enabled)
    .bind(&job.next_run_at)
    .execute(pool)
    .await
    .context("Failed to insert scheduled job")?;

    Ok(result.last_insert_rowid())
}

/// Get a scheduled job by ID.
pub async fn get_job(pool: &SqlitePool, id: i64) -> Result<Option<ScheduledJob>> {
    sqlx::query_as("SELECT * FROM scheduled_jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch scheduled job")
}

/// List all scheduled jobs.
pub async fn list_jobs(pool: &SqlitePool) -> Result<Vec<ScheduledJob>> {
    sqlx::query_as("SELECT * FROM scheduled_jobs ORDER BY id ASC")
        .fetch_all(pool)
        .await
        .context("Failed to list scheduled jobs")
}

/// Overwrite a job's definition (type, schedule, target, enabled, next run).
///
/// Run bookkeeping and claim columns are left untouched.
pub async fn save_job_definition(pool: &SqlitePool, job: &ScheduledJob) -> Result<bool> {
    let result = sqlx::query(
        r"
        UPDATE scheduled_jobs
        SET job_type = ?, schedule_type = ?, schedule_config = ?, target_type = ?,
            target_id = ?, enabled = ?, next_run_at = ?, updated_at = ?
        WHERE id = ?
        ",
    )
    .bind(&job.job_type)
    .bind(&job.schedule_type)
    .bind(&job.schedule_config)
    .bind(&job.target_type)
    .bind(job.target_id)
    .bind(job.enabled)
    .bind(&job.next_run_at)
    .bind(now_timestamp())
    .bind(job.id)
    .execute(pool)
    .await
    .context("Failed to update scheduled job")?;

    Ok(result.rows_affected() > 0)
}

/// Delete a scheduled job and its execution history.
pub async fn delete_job(pool: &SqlitePool, id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM scheduled_jobs WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to delete scheduled job")?;
    Ok(result.rows_affected() > 0)
}

/// Enabled jobs whose `next_run_at` has passed and that hold no live claim.
pub async fn get_due_jobs(pool: &SqlitePool, now: &str, limit: i64) -> Result<Vec<ScheduledJob>> {
    sqlx::query_as(
        r"
        SELECT * FROM scheduled_jobs
        WHERE enabled = 1
          AND next_run_at IS NOT NULL
          AND next_run_at <= ?
          AND (claim_token IS NULL OR claim_expires_at IS NULL OR claim_expires_at <= ?)
        ORDER BY next_run_at ASC
        LIMIT ?
        ",
    )
    .bind(now)
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to fetch due jobs")
}

/// Atomically claim a job for one run.
///
/// Succeeds only when no claim exists or the previous one has expired, so
/// exactly one of any number of concurrent callers wins.
pub async fn claim_job(
    pool: &SqlitePool,
    id: i64,
    token: &str,
    now: &str,
    expires_at: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r"
        UPDATE scheduled_jobs
        SET claim_token = ?, claim_expires_at = ?
        WHERE id = ?
          AND enabled = 1
          AND (claim_token IS NULL OR claim_expires_at IS NULL OR claim_expires_at <= ?)
        ",
    )
    .bind(token)
    .bind(expires_at)
    .bind(id)
    .bind(now)
    .execute(pool)
    .await
    .context("Failed to claim job")?;

    Ok(result.rows_affected() == 1)
}

/// Push out the lease of a claim still held by `token`.
pub async fn extend_claim(pool: &SqlitePool, id: i64, token: &str, expires_at: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE scheduled_jobs SET claim_expires_at = ? WHERE id = ? AND claim_token = ?",
    )
    .bind(expires_at)
    .bind(id)
    .bind(token)
    .execute(pool)
    .await
    .context("Failed to extend job claim")?;
    Ok(result.rows_affected() == 1)
}

/// Record a finished run and release the claim.
///
/// Returns false if the claim was lost (lease expired and another tick took
/// the job), in which case nothing is written. `outcome.enabled = false`
/// disables the job; `true` keeps whatever `enabled` holds now, so a toggle
/// made during the run survives.
pub async fn finish_job_run(
    pool: &SqlitePool,
    id: i64,
    token: &str,
    outcome: &JobRunOutcome,
) -> Result<bool> {
    let succeeded = i64::from(outcome.status == RunStatus::Ok);
    let result = sqlx::query(
        r"
        UPDATE scheduled_jobs
        SET last_status = ?, last_error = ?, last_run_at = ?, next_run_at = ?,
            enabled = CASE WHEN ? THEN enabled ELSE 0 END,
            consecutive_failures = ?,
            run_count = run_count + 1,
            success_count = success_count + ?,
            failure_count = failure_count + (1 - ?),
            claim_token = NULL, claim_expires_at = NULL,
            updated_at = ?
        WHERE id = ? AND claim_token = ?
        ",
    )
    .bind(outcome.status.as_str())
    .bind(&outcome.error)
    .bind(&outcome.last_run_at)
    .bind(&outcome.next_run_at)
    .bind(outcome.enabled)
    .bind(outcome.consecutive_failures)
    .bind(succeeded)
    .bind(succeeded)
    .bind(now_timestamp())
    .bind(id)
    .bind(token)
    .execute(pool)
    .await
    .context("Failed to record job run")?;

    Ok(result.rows_affected() == 1)
}

/// Drop a claim without recording a run.
pub async fn release_claim(pool: &SqlitePool, id: i64, token: &str) -> Result<()> {
    sqlx::query(
        "UPDATE scheduled_jobs SET claim_token = NULL, claim_expires_at = NULL WHERE id = ? AND claim_token = ?",
    )
    .bind(id)
    .bind(token)
    .execute(pool)
    .await
    .context("Failed to release job claim")?;
    Ok(())
}

// ========== Job executions ==========

/// Open a running execution row.
pub async fn open_execution(pool: &SqlitePool, job_id: i64, started_at: &str) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO job_executions (job_id, started_at, status) VALUES (?, ?, 'running')",
    )
    .bind(job_id)
    .bind(started_at)
    .execute(pool)
    .await
    .context("Failed to open job execution")?;
    Ok(result.last_insert_rowid())
}

/// Close an execution with its final status.
pub async fn close_execution(
    pool: &SqlitePool,
    id: i64,
    status: RunStatus,
    error: Option<&str>,
    stats: Option<&str>,
    duration_ms: i64,
) -> Result<()> {
    sqlx::query(
        r"
        UPDATE job_executions
        SET status = ?, error = ?, stats = ?, duration_ms = ?, finished_at = ?
        WHERE id = ? AND status = 'running'
        ",
    )
    .bind(status.as_str())
    .bind(error)
    .bind(stats)
    .bind(duration_ms)
    .bind(now_timestamp())
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to close job execution")?;
    Ok(())
}

/// Fail executions left `running` by a claim that expired.
pub async fn fail_orphaned_executions(pool: &SqlitePool, job_id: i64, reason: &str) -> Result<u64> {
    let result = sqlx::query(
        r"
        UPDATE job_executions
        SET status = 'failed', error = ?, finished_at = ?
        WHERE job_id = ? AND status = 'running'
        ",
    )
    .bind(reason)
    .bind(now_timestamp())
    .bind(job_id)
    .execute(pool)
    .await
    .context("Failed to fail orphaned executions")?;
    Ok(result.rows_affected())
}

/// Most recent executions of a job, newest first.
pub async fn job_history(pool: &SqlitePool, job_id: i64, limit: i64) -> Result<Vec<JobExecution>> {
    sqlx::query_as(
        "SELECT * FROM job_executions WHERE job_id = ? ORDER BY started_at DESC, id DESC LIMIT ?",
    )
    .bind(job_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to fetch job history")
}

/// Delete finished executions that started before `cutoff`.
pub async fn delete_executions_before(pool: &SqlitePool, cutoff: &str) -> Result<u64> {
    let result =
        sqlx::query("DELETE FROM job_executions WHERE status != 'running' AND started_at < ?")
            .bind(cutoff)
            .execute(pool)
            .await
            .context("Failed to delete old executions")?;
    Ok(result.rows_affected())
}

/// Delete one-shot jobs that have run and been disabled, last run before
/// `cutoff`. Their executions go with them.
pub async fn delete_finished_once_jobs(pool: &SqlitePool, cutoff: &str) -> Result<u64> {
    let result = sqlx::query(
        r"
        DELETE FROM scheduled_jobs
        WHERE schedule_type = 'once'
          AND enabled = 0
          AND claim_token IS NULL
          AND last_run_at IS NOT NULL
          AND last_run_at < ?
          AND NOT EXISTS (
                SELECT 1 FROM job_executions e
                WHERE e.job_id = scheduled_jobs.id AND e.status = 'running'
          )
        ",
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .context("Failed to delete finished one-shot jobs")?;
    Ok(result.rows_affected())
}

// ========== Activities ==========

/// Insert a running activity, returning its ID.
pub async fn insert_activity(
    pool: &SqlitePool,
    task_type: &str,
    label: &str,
    total: Option<i64>,
) -> Result<i64> {
    let now = now_timestamp();
    let result = sqlx::query(
        r"
        INSERT INTO activities (task_type, label, status, progress_total, started_at, updated_at)
        VALUES (?, ?, 'running', ?, ?, ?)
        ",
    )
    .bind(task_type)
    .bind(label)
    .bind(total)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await
    .context("Failed to insert activity")?;
    Ok(result.last_insert_rowid())
}

/// Get an activity by ID.
pub async fn get_activity(pool: &SqlitePool, id: i64) -> Result<Option<Activity>> {
    sqlx::query_as("SELECT * FROM activities WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch activity")
}

/// Write progress for a running activity. Finished activities are never touched.
pub async fn update_activity_progress(
    pool: &SqlitePool,
    id: i64,
    current: i64,
    total: Option<i64>,
    details: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        r"
        UPDATE activities
        SET progress_current = ?,
            progress_total = COALESCE(?, progress_total),
            details = COALESCE(?, details),
            updated_at = ?
        WHERE id = ? AND status = 'running'
        ",
    )
    .bind(current)
    .bind(total)
    .bind(details)
    .bind(now_timestamp())
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to update activity progress")?;
    Ok(result.rows_affected() == 1)
}

/// Move a running activity to a terminal status.
pub async fn finish_activity(
    pool: &SqlitePool,
    id: i64,
    status: &str,
    error: Option<&str>,
) -> Result<bool> {
    let now = now_timestamp();
    let result = sqlx::query(
        r"
        UPDATE activities
        SET status = ?, error = ?, finished_at = ?, updated_at = ?, is_paused = 0
        WHERE id = ? AND status = 'running'
        ",
    )
    .bind(status)
    .bind(error)
    .bind(&now)
    .bind(&now)
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to finish activity")?;
    Ok(result.rows_affected() == 1)
}

/// Set the pause flag on a running activity.
pub async fn set_activity_paused(pool: &SqlitePool, id: i64, paused: bool) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE activities SET is_paused = ?, updated_at = ? WHERE id = ? AND status = 'running'",
    )
    .bind(paused)
    .bind(now_timestamp())
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to set activity pause flag")?;
    Ok(result.rows_affected() == 1)
}

/// List activities matching a filter, newest first.
pub async fn list_activities(pool: &SqlitePool, filter: &ActivityFilter) -> Result<Vec<Activity>> {
    let mut sql = String::from("SELECT * FROM activities WHERE 1 = 1");
    let mut binds: Vec<&str> = Vec::new();
    if let Some(status) = filter.status.as_deref() {
        sql.push_str(" AND status = ?");
        binds.push(status);
    }
    if let Some(task_type) = filter.task_type.as_deref() {
        sql.push_str(" AND task_type = ?");
        binds.push(task_type);
    }
    sql.push_str(" ORDER BY started_at DESC, id DESC LIMIT ?");

    let mut query = sqlx::query_as::<_, Activity>(&sql);
    for value in binds {
        query = query.bind(value);
    }
    query
        .bind(filter.limit.unwrap_or(50).clamp(1, 500))
        .fetch_all(pool)
        .await
        .context("Failed to list activities")
}

/// Activity counts grouped by status.
pub async fn count_activities_by_status(pool: &SqlitePool) -> Result<HashMap<String, i64>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM activities GROUP BY status")
            .fetch_all(pool)
            .await
            .context("Failed to count activities")?;
    Ok(rows.into_iter().collect())
}

/// Delete finished activities that ended before `cutoff`.
pub async fn delete_activities_before(pool: &SqlitePool, cutoff: &str) -> Result<u64> {
    let result = sqlx::query(
        r"
        DELETE FROM activities
        WHERE status IN ('completed', 'failed') AND finished_at IS NOT NULL AND finished_at < ?
        ",
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .context("Failed to delete old activities")?;
    Ok(result.rows_affected())
}

/// Fail activities left running by a previous process.
pub async fn fail_interrupted_activities(pool: &SqlitePool) -> Result<u64> {
    let now = now_timestamp();
    let result = sqlx::query(
        r"
        UPDATE activities
        SET status = 'failed', error = 'interrupted by restart', finished_at = ?, updated_at = ?
        WHERE status = 'running'
        ",
    )
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await
    .context("Failed to fail interrupted activities")?;
    Ok(result.rows_affected())
}

// ========== Threads ==========

/// Ensure a thread row exists for `url`. Returns `(id, created)`.
///
/// Safe under concurrent callers: the unique index on `url` arbitrates.
pub async fn upsert_thread_url(pool: &SqlitePool, url: &str) -> Result<(i64, bool)> {
    let result = sqlx::query("INSERT INTO threads (url) VALUES (?) ON CONFLICT(url) DO NOTHING")
        .bind(url)
        .execute(pool)
        .await
        .context("Failed to insert thread")?;
    let created = result.rows_affected() == 1;

    let (id,): (i64,) = sqlx::query_as("SELECT id FROM threads WHERE url = ?")
        .bind(url)
        .fetch_one(pool)
        .await
        .context("Failed to fetch thread id")?;
    Ok((id, created))
}

/// Get a thread by ID.
pub async fn get_thread(pool: &SqlitePool, id: i64) -> Result<Option<Thread>> {
    sqlx::query_as(
        r"
        SELECT id, url, external_id, title, forum_category, tags, view_count, reply_count,
               first_seen_at, last_scraped_at, is_active
        FROM threads WHERE id = ?
        ",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("Failed to fetch thread")
}

/// Get a thread by URL.
pub async fn get_thread_by_url(pool: &SqlitePool, url: &str) -> Result<Option<Thread>> {
    sqlx::query_as(
        r"
        SELECT id, url, external_id, title, forum_category, tags, view_count, reply_count,
               first_seen_at, last_scraped_at, is_active
        FROM threads WHERE url = ?
        ",
    )
    .bind(url)
    .fetch_optional(pool)
    .await
    .context("Failed to fetch thread by url")
}

/// Paginated thread listing with aggregate counts. Returns `(rows, total)`.
pub async fn list_threads(pool: &SqlitePool, query: &ThreadQuery) -> Result<(Vec<ThreadSummary>, i64)> {
    let pattern = query.search.as_deref().map(like_pattern);
    let mut where_sql = String::from("WHERE 1 = 1");
    let mut binds: Vec<&str> = Vec::new();

    if let Some(provider) = query.provider.as_deref() {
        where_sql.push_str(
            " AND EXISTS (SELECT 1 FROM download_links pl WHERE pl.thread_id = t.id AND pl.provider = ?)",
        );
        binds.push(provider);
    }
    match query.filter {
        Some(ThreadFilter::HasDownloads) => where_sql
            .push_str(" AND EXISTS (SELECT 1 FROM download_links dl WHERE dl.thread_id = t.id)"),
        Some(ThreadFilter::NoDownloads) => where_sql.push_str(
            " AND NOT EXISTS (SELECT 1 FROM download_links dl WHERE dl.thread_id = t.id)",
        ),
        None => {}
    }
    if let Some(pattern) = pattern.as_deref() {
        where_sql.push_str(
            r" AND (t.title LIKE ? ESCAPE '\'
                 OR EXISTS (SELECT 1 FROM posts sp WHERE sp.thread_id = t.id AND sp.author LIKE ? ESCAPE '\'))",
        );
        binds.push(pattern);
        binds.push(pattern);
    }

    let count_sql = format!("SELECT COUNT(*) FROM threads t {where_sql}");
    let mut count_query = sqlx::query_as::<_, (i64,)>(&count_sql);
    for value in &binds {
        count_query = count_query.bind(*value);
    }
    let (total,) = count_query
        .fetch_one(pool)
        .await
        .context("Failed to count threads")?;

    let sql = format!(
        r"
        SELECT t.id, t.url, t.title, t.forum_category, t.first_seen_at, t.last_scraped_at,
               t.is_active,
               (SELECT COUNT(*) FROM posts p WHERE p.thread_id = t.id AND p.removed_at IS NULL)
                   AS post_count,
               (SELECT COUNT(*) FROM download_links l WHERE l.thread_id = t.id) AS link_count,
               (SELECT COUNT(*) FROM download_links l
                    WHERE l.thread_id = t.id AND l.status = 'active') AS active_link_count
        FROM threads t
        {where_sql}
        ORDER BY {}
        LIMIT ? OFFSET ?
        ",
        query.sort.order_clause()
    );

    let limit = query.limit.clamp(1, 200);
    let offset = (query.page.max(1) - 1) * limit;
    let mut rows_query = sqlx::query_as::<_, ThreadSummary>(&sql);
    for value in &binds {
        rows_query = rows_query.bind(*value);
    }
    let rows = rows_query
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .context("Failed to list threads")?;

    Ok((rows, total))
}

/// `%needle%` with LIKE wildcards in `needle` matched literally.
fn like_pattern(needle: &str) -> String {
    let escaped = needle
        .trim()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

/// Threads linked to a performer, most recently scraped first.
pub async fn list_threads_for_performer(pool: &SqlitePool, performer_id: i64) -> Result<Vec<ThreadSummary>> {
    sqlx::query_as(
        r"
        SELECT t.id, t.url, t.title, t.forum_category, t.first_seen_at, t.last_scraped_at,
               t.is_active,
               (SELECT COUNT(*) FROM posts p WHERE p.thread_id = t.id AND p.removed_at IS NULL)
                   AS post_count,
               (SELECT COUNT(*) FROM download_links l WHERE l.thread_id = t.id) AS link_count,
               (SELECT COUNT(*) FROM download_links l
                    WHERE l.thread_id = t.id AND l.status = 'active') AS active_link_count
        FROM threads t
        JOIN thread_performers tp ON tp.thread_id = t.id
        WHERE tp.performer_id = ?
        ORDER BY t.last_scraped_at IS NULL, t.last_scraped_at DESC, t.id DESC
        ",
    )
    .bind(performer_id)
    .fetch_all(pool)
    .await
    .context("Failed to list performer threads")
}

/// Delete threads with their posts, links and performer associations, plus
/// queued jobs that target them. Returns how many threads were deleted.
pub async fn delete_threads(pool: &SqlitePool, ids: &[i64]) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let mut tx = pool.begin().await.context("Failed to begin thread delete")?;

    let jobs_sql = format!(
        "DELETE FROM scheduled_jobs WHERE target_type = 'thread' AND claim_token IS NULL AND target_id IN ({placeholders})"
    );
    let mut jobs = sqlx::query(&jobs_sql);
    for id in ids {
        jobs = jobs.bind(id);
    }
    jobs.execute(&mut *tx)
        .await
        .context("Failed to delete jobs for threads")?;

    // Posts, links and performer rows cascade
    let threads_sql = format!("DELETE FROM threads WHERE id IN ({placeholders})");
    let mut threads = sqlx::query(&threads_sql);
    for id in ids {
        threads = threads.bind(id);
    }
    let deleted = threads
        .execute(&mut *tx)
        .await
        .context("Failed to delete threads")?
        .rows_affected();

    tx.commit().await.context("Failed to commit thread delete")?;
    Ok(deleted)
}

/// Delete every thread and the jobs that target threads.
pub async fn delete_all_threads(pool: &SqlitePool) -> Result<u64> {
    let mut tx = pool.begin().await.context("Failed to begin thread delete")?;
    sqlx::query("DELETE FROM scheduled_jobs WHERE target_type = 'thread' AND claim_token IS NULL")
        .execute(&mut *tx)
        .await
        .context("Failed to delete jobs for threads")?;
    let deleted = sqlx::query("DELETE FROM threads")
        .execute(&mut *tx)
        .await
        .context("Failed to delete threads")?
        .rows_affected();
    tx.commit().await.context("Failed to commit thread delete")?;
    Ok(deleted)
}

/// Commit a scrape snapshot in one transaction.
///
/// Posts keep identity by `(thread_id, external_post_id)` and links by
/// `(thread_id, url)`. Posts absent from the snapshot get `removed_at`. Link
/// verification and download columns are never written here.
/// `last_scraped_at` is the final write of the transaction.
pub async fn commit_thread_snapshot(
    pool: &SqlitePool,
    thread_id: i64,
    snapshot: &ThreadSnapshot,
) -> Result<SnapshotStats> {
    let mut stats = SnapshotStats::default();
    let mut tx = pool.begin().await.context("Failed to begin snapshot")?;
    let now = now_timestamp();

    let tags = if snapshot.tags.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&snapshot.tags).context("Failed to encode tags")?)
    };
    sqlx::query(
        r"
        UPDATE threads
        SET external_id = COALESCE(?, external_id),
            title = COALESCE(?, title),
            forum_category = COALESCE(?, forum_category),
            tags = COALESCE(?, tags),
            view_count = COALESCE(?, view_count),
            reply_count = COALESCE(?, reply_count),
            is_active = 1
        WHERE id = ?
        ",
    )
    .bind(&snapshot.external_id)
    .bind(&snapshot.title)
    .bind(&snapshot.forum_category)
    .bind(&tags)
    .bind(snapshot.view_count)
    .bind(snapshot.reply_count)
    .bind(thread_id)
    .execute(&mut *tx)
    .await
    .context("Failed to update thread metadata")?;

    let existing_posts: Vec<(String, i64, String, i64, Option<String>)> = sqlx::query_as(
        "SELECT external_post_id, id, content_hash, order_index, removed_at FROM posts WHERE thread_id = ?",
    )
    .bind(thread_id)
    .fetch_all(&mut *tx)
    .await
    .context("Failed to load existing posts")?;
    let existing_posts: HashMap<String, (i64, String, i64, Option<String>)> = existing_posts
        .into_iter()
        .map(|(ext, id, hash, order, removed)| (ext, (id, hash, order, removed)))
        .collect();

    let existing_links: Vec<(String,)> =
        sqlx::query_as("SELECT url FROM download_links WHERE thread_id = ?")
            .bind(thread_id)
            .fetch_all(&mut *tx)
            .await
            .context("Failed to load existing links")?;
    let mut known_links: HashSet<String> = existing_links.into_iter().map(|(u,)| u).collect();

    let mut seen_posts = HashSet::new();
    for post in &snapshot.posts {
        if !seen_posts.insert(post.external_post_id.as_str()) {
            continue;
        }
        let hash = content_hash(&post.body);

        let post_id = if let Some((id, old_hash, old_order, removed_at)) =
            existing_posts.get(&post.external_post_id)
        {
            if *old_hash != hash || *old_order != post.order_index || removed_at.is_some() {
                sqlx::query(
                    r"
                    UPDATE posts
                    SET author = ?, posted_at = ?, body = ?, content_hash = ?, order_index = ?,
                        updated_at = ?, removed_at = NULL
                    WHERE id = ?
                    ",
                )
                .bind(&post.author)
                .bind(&post.posted_at)
                .bind(&post.body)
                .bind(&hash)
                .bind(post.order_index)
                .bind(&now)
                .bind(id)
                .execute(&mut *tx)
                .await
                .context("Failed to update post")?;
                stats.posts_updated += 1;
            }
            *id
        } else {
            let result = sqlx::query(
                r"
                INSERT INTO posts
                    (thread_id, external_post_id, author, posted_at, body, content_hash,
                     order_index, first_seen_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(thread_id)
            .bind(&post.external_post_id)
            .bind(&post.author)
            .bind(&post.posted_at)
            .bind(&post.body)
            .bind(&hash)
            .bind(post.order_index)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .context("Failed to insert post")?;
            stats.posts_inserted += 1;
            result.last_insert_rowid()
        };

        for link in &post.links {
            sqlx::query(
                r"
                INSERT INTO download_links (thread_id, post_id, url, provider, filename, first_seen_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(thread_id, url) DO UPDATE SET
                    post_id = COALESCE(download_links.post_id, excluded.post_id),
                    filename = COALESCE(download_links.filename, excluded.filename)
                ",
            )
            .bind(thread_id)
            .bind(post_id)
            .bind(&link.url)
            .bind(&link.provider)
            .bind(&link.filename)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .context("Failed to upsert download link")?;

            if known_links.insert(link.url.clone()) {
                stats.links_inserted += 1;
            }
            stats.links_seen += 1;
        }
    }

    for (external_id, (id, _, _, removed_at)) in &existing_posts {
        if removed_at.is_none() && !seen_posts.contains(external_id.as_str()) {
            sqlx::query("UPDATE posts SET removed_at = ? WHERE id = ?")
                .bind(&now)
                .bind(id)
                .execute(&mut *tx)
                .await
                .context("Failed to mark removed post")?;
            stats.posts_removed += 1;
        }
    }

    for name in &snapshot.performer_names {
        let performer: Option<(i64,)> = sqlx::query_as("SELECT id FROM performers WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to look up performer")?;
        if let Some((performer_id,)) = performer {
            sqlx::query(
                r"
                INSERT INTO thread_performers (thread_id, performer_id, confidence)
                VALUES (?, ?, ?)
                ON CONFLICT(thread_id, performer_id) DO UPDATE SET
                    confidence = MAX(thread_performers.confidence, excluded.confidence)
                ",
            )
            .bind(thread_id)
            .bind(performer_id)
            .bind(TITLE_MATCH_CONFIDENCE)
            .execute(&mut *tx)
            .await
            .context("Failed to link performer")?;
            stats.performers_linked += 1;
        }
    }

    sqlx::query("UPDATE threads SET last_scraped_at = ? WHERE id = ?")
        .bind(now_timestamp())
        .bind(thread_id)
        .execute(&mut *tx)
        .await
        .context("Failed to stamp last_scraped_at")?;

    tx.commit().await.context("Failed to commit snapshot")?;
    Ok(stats)
}

// ========== Posts ==========

/// Posts of a thread in page order, including removed ones.
pub async fn get_posts_for_thread(pool: &SqlitePool, thread_id: i64) -> Result<Vec<Post>> {
    sqlx::query_as("SELECT * FROM posts WHERE thread_id = ? ORDER BY order_index ASC, id ASC")
        .bind(thread_id)
        .fetch_all(pool)
        .await
        .context("Failed to fetch posts")
}

// ========== Download links ==========

/// Get a download link by ID.
pub async fn get_link(pool: &SqlitePool, id: i64) -> Result<Option<DownloadLink>> {
    sqlx::query_as("SELECT * FROM download_links WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch download link")
}

/// Links of a thread, oldest first.
pub async fn get_links_for_thread(pool: &SqlitePool, thread_id: i64) -> Result<Vec<DownloadLink>> {
    sqlx::query_as("SELECT * FROM download_links WHERE thread_id = ? ORDER BY id ASC")
        .bind(thread_id)
        .fetch_all(pool)
        .await
        .context("Failed to fetch thread links")
}

/// Links due for a check.
///
/// A link is due when it was never checked, its last check is older than
/// `cutoff`, it is retrying after network failures and is not yet dead, or
/// its rate-limit cooldown has passed. Links still cooling down are skipped.
/// Expired cooldowns come first (most recent first), then oldest checks.
pub async fn get_links_due_for_check(
    pool: &SqlitePool,
    cutoff: &str,
    now: &str,
    limit: i64,
) -> Result<Vec<DownloadLink>> {
    sqlx::query_as(
        r"
        SELECT * FROM download_links
        WHERE (rate_limited_until IS NULL OR rate_limited_until <= ?)
          AND (
                last_checked_at IS NULL
             OR last_checked_at < ?
             OR (consecutive_failures > 0 AND status != 'dead')
             OR status = 'rate_limited'
          )
        ORDER BY CASE WHEN rate_limited_until IS NULL THEN 1 ELSE 0 END ASC,
                 rate_limited_until DESC,
                 last_checked_at ASC,
                 id ASC
        LIMIT ?
        ",
    )
    .bind(now)
    .bind(cutoff)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to fetch links due for check")
}

/// Write a probe result, conditional on `status_version` being unchanged.
///
/// Returns false when another writer got there first.
pub async fn apply_link_check(
    pool: &SqlitePool,
    id: i64,
    expected_version: i64,
    update: &LinkCheckUpdate,
) -> Result<bool> {
    let result = sqlx::query(
        r"
        UPDATE download_links
        SET status = ?,
            status_version = status_version + 1,
            last_checked_at = ?,
            check_count = check_count + 1,
            consecutive_failures = ?,
            requires_auth = ?,
            rate_limited_until = ?,
            last_http_status = COALESCE(?, last_http_status),
            file_size = COALESCE(?, file_size),
            file_type = COALESCE(?, file_type)
        WHERE id = ? AND status_version = ?
        ",
    )
    .bind(update.status.as_str())
    .bind(&update.checked_at)
    .bind(update.consecutive_failures)
    .bind(update.requires_auth)
    .bind(&update.rate_limited_until)
    .bind(update.http_status)
    .bind(update.file_size)
    .bind(&update.file_type)
    .bind(id)
    .bind(expected_version)
    .execute(pool)
    .await
    .context("Failed to apply link check")?;
    Ok(result.rows_affected() == 1)
}

/// Per-status link counts, optionally for one thread.
pub async fn link_status_counts(pool: &SqlitePool, thread_id: Option<i64>) -> Result<LinkStatusCounts> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r"
        SELECT status, COUNT(*) FROM download_links
        WHERE (? IS NULL OR thread_id = ?)
        GROUP BY status
        ",
    )
    .bind(thread_id)
    .bind(thread_id)
    .fetch_all(pool)
    .await
    .context("Failed to count links by status")?;

    let mut counts = LinkStatusCounts::default();
    for (status, count) in rows {
        counts.total += count;
        match status.as_str() {
            "active" => counts.active += count,
            "dead" => counts.dead += count,
            "rate_limited" => counts.rate_limited += count,
            _ => counts.unknown += count,
        }
    }
    Ok(counts)
}

/// Mark a link downloaded. Refused (false) if it already is.
pub async fn mark_link_downloaded(
    pool: &SqlitePool,
    id: i64,
    path: Option<&str>,
    notes: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        r"
        UPDATE download_links
        SET download_status = 'downloaded', downloaded_at = ?,
            download_path = COALESCE(?, download_path), notes = COALESCE(?, notes)
        WHERE id = ? AND download_status != 'downloaded'
        ",
    )
    .bind(now_timestamp())
    .bind(path)
    .bind(notes)
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to mark link downloaded")?;
    Ok(result.rows_affected() == 1)
}

/// Mark a link's download as failed. Downloaded links are left alone.
pub async fn mark_link_download_failed(pool: &SqlitePool, id: i64, notes: Option<&str>) -> Result<bool> {
    let result = sqlx::query(
        r"
        UPDATE download_links
        SET download_status = 'failed', notes = COALESCE(?, notes)
        WHERE id = ? AND download_status != 'downloaded'
        ",
    )
    .bind(notes)
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to mark link download failed")?;
    Ok(result.rows_affected() == 1)
}

/// Explicitly return a link to `pending`, clearing download details.
pub async fn reset_link_download(pool: &SqlitePool, id: i64) -> Result<bool> {
    let result = sqlx::query(
        r"
        UPDATE download_links
        SET download_status = 'pending', downloaded_at = NULL, download_path = NULL
        WHERE id = ?
        ",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to reset link download")?;
    Ok(result.rows_affected() == 1)
}

// ========== Performers ==========

/// Insert a performer (case-insensitive unique), returning its ID.
pub async fn insert_performer(pool: &SqlitePool, name: &str) -> Result<i64> {
    sqlx::query("INSERT INTO performers (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
        .bind(name)
        .execute(pool)
        .await
        .context("Failed to insert performer")?;
    let (id,): (i64,) = sqlx::query_as("SELECT id FROM performers WHERE name = ?")
        .bind(name)
        .fetch_one(pool)
        .await
        .context("Failed to fetch performer id")?;
    Ok(id)
}

pub async fn get_performer(pool: &SqlitePool, id: i64) -> Result<Option<Performer>> {
    sqlx::query_as("SELECT id, name FROM performers WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch performer")
}

pub async fn get_performer_by_name(pool: &SqlitePool, name: &str) -> Result<Option<Performer>> {
    sqlx::query_as("SELECT id, name FROM performers WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch performer by name")
}

/// Link a thread to a performer at `confidence`, replacing any earlier value.
pub async fn link_thread_performer(
    pool: &SqlitePool,
    thread_id: i64,
    performer_id: i64,
    confidence: f64,
) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO thread_performers (thread_id, performer_id, confidence)
        VALUES (?, ?, ?)
        ON CONFLICT(thread_id, performer_id) DO UPDATE SET confidence = excluded.confidence
        ",
    )
    .bind(thread_id)
    .bind(performer_id)
    .bind(confidence)
    .execute(pool)
    .await
    .context("Failed to link performer")?;
    Ok(())
}

/// Link a thread to a performer found by title, keeping a higher confidence
/// already on record. Returns false if the link already existed.
pub async fn suggest_thread_performer(
    pool: &SqlitePool,
    thread_id: i64,
    performer_id: i64,
    confidence: f64,
) -> Result<bool> {
    let existing: Option<(f64,)> =
        sqlx::query_as("SELECT confidence FROM thread_performers WHERE thread_id = ? AND performer_id = ?")
            .bind(thread_id)
            .bind(performer_id)
            .fetch_optional(pool)
            .await
            .context("Failed to look up performer link")?;
    if existing.is_some() {
        sqlx::query(
            "UPDATE thread_performers SET confidence = MAX(confidence, ?) WHERE thread_id = ? AND performer_id = ?",
        )
        .bind(confidence)
        .bind(thread_id)
        .bind(performer_id)
        .execute(pool)
        .await
        .context("Failed to update performer link")?;
        return Ok(false);
    }
    link_thread_performer(pool, thread_id, performer_id, confidence).await?;
    Ok(true)
}

/// Every thread's ID and title, for title-based matching.
pub async fn thread_titles(pool: &SqlitePool) -> Result<Vec<(i64, Option<String>)>> {
    sqlx::query_as("SELECT id, title FROM threads ORDER BY id ASC")
        .fetch_all(pool)
        .await
        .context("Failed to fetch thread titles")
}

/// Performers linked to a thread, highest confidence first.
pub async fn get_thread_performers(pool: &SqlitePool, thread_id: i64) -> Result<Vec<ThreadPerformer>> {
    sqlx::query_as(
        r"
        SELECT tp.performer_id, p.name, tp.confidence
        FROM thread_performers tp
        JOIN performers p ON p.id = tp.performer_id
        WHERE tp.thread_id = ?
        ORDER BY tp.confidence DESC, p.name ASC
        ",
    )
    .bind(thread_id)
    .fetch_all(pool)
    .await
    .context("Failed to fetch thread performers")
}

// ========== Libraries & videos ==========

/// Register a library root.
pub async fn insert_library(pool: &SqlitePool, name: &str, path: &str) -> Result<i64> {
    let result = sqlx::query("INSERT INTO libraries (name, path) VALUES (?, ?)")
        .bind(name)
        .bind(path)
        .execute(pool)
        .await
        .context("Failed to insert library")?;
    Ok(result.last_insert_rowid())
}

/// Get a library by ID.
pub async fn get_library(pool: &SqlitePool, id: i64) -> Result<Option<Library>> {
    sqlx::query_as("SELECT * FROM libraries WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch library")
}

/// Catalog a video inside a library.
pub async fn insert_video(
    pool: &SqlitePool,
    library_id: i64,
    relative_path: &str,
    title: Option<&str>,
    file_size: Option<i64>,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO videos (library_id, relative_path, title, file_size) VALUES (?, ?, ?, ?)",
    )
    .bind(library_id)
    .bind(relative_path)
    .bind(title)
    .bind(file_size)
    .execute(pool)
    .await
    .context("Failed to insert video")?;
    Ok(result.last_insert_rowid())
}

/// Get a video together with its library.
pub async fn get_video_with_library(pool: &SqlitePool, id: i64) -> Result<Option<(Video, Library)>> {
    let Some(video) = sqlx::query_as::<_, Video>("SELECT * FROM videos WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch video")?
    else {
        return Ok(None);
    };
    let library = get_library(pool, video.library_id)
        .await?
        .context("Video references a missing library")?;
    Ok(Some((video, library)))
}

// ========== Audit log ==========

/// Append an audit log row.
pub async fn insert_audit_log(pool: &SqlitePool, operation: &str, details: Option<&str>) -> Result<i64> {
    let result = sqlx::query("INSERT INTO ai_audit_logs (operation, details) VALUES (?, ?)")
        .bind(operation)
        .bind(details)
        .execute(pool)
        .await
        .context("Failed to insert audit log")?;
    Ok(result.last_insert_rowid())
}

/// Delete audit log rows created before `cutoff`.
pub async fn delete_audit_logs_before(pool: &SqlitePool, cutoff: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM ai_audit_logs WHERE created_at < ?")
        .bind(cutoff)
        .execute(pool)
        .await
        .context("Failed to delete old audit logs")?;
    Ok(result.rows_affected())
}

// ========== Stats ==========

/// Archive-wide totals.
pub async fn archive_stats(pool: &SqlitePool) -> Result<ArchiveStats> {
    let (threads,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM threads")
        .fetch_one(pool)
        .await
        .context("Failed to count threads")?;
    let (posts,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts WHERE removed_at IS NULL")
        .fetch_one(pool)
        .await
        .context("Failed to count posts")?;
    let (downloaded,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM download_links WHERE download_status = 'downloaded'")
            .fetch_one(pool)
            .await
            .context("Failed to count downloaded links")?;
    let providers: Vec<ProviderCount> = sqlx::query_as(
        r"
        SELECT provider, COUNT(*) AS count FROM download_links
        GROUP BY provider ORDER BY count DESC, provider ASC
        ",
    )
    .fetch_all(pool)
    .await
    .context("Failed to count links by provider")?;

    Ok(ArchiveStats {
        threads,
        posts,
        links: link_status_counts(pool, None).await?,
        downloaded,
        providers,
    })
}
