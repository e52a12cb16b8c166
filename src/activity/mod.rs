//! Activity ledger: uniform progress records for long-running work.
//!
//! Progress writes are coalesced so that at most one `Step` per activity per
//! [`ACTIVITY_STEP_COALESCE_MS`] reaches the store; the latest value is always
//! flushed, either by a deferred write or when the activity closes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::ACTIVITY_STEP_COALESCE_MS;
use crate::db::{
    count_activities_by_status, delete_activities_before, finish_activity, format_timestamp,
    get_activity, insert_activity, list_activities, set_activity_paused,
    update_activity_progress, Activity, ActivityFilter, ActivityStatus, Database,
};
use crate::hub::{Event, Hub, Topic};

/// How a closed activity ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
}

impl Outcome {
    fn status(self) -> ActivityStatus {
        match self {
            Self::Completed => ActivityStatus::Completed,
            Self::Failed => ActivityStatus::Failed,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingStep {
    current: i64,
    total: Option<i64>,
    details: Option<String>,
}

#[derive(Debug)]
struct StepState {
    last_current: Option<i64>,
    last_write: Option<Instant>,
    pending: Option<PendingStep>,
    flush_scheduled: bool,
}

/// Counts by status plus everything still running.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerStatus {
    pub counts: HashMap<String, i64>,
    pub running: Vec<Activity>,
}

#[derive(Clone)]
pub struct ActivityLedger {
    db: Database,
    hub: Hub,
    steps: Arc<Mutex<HashMap<i64, StepState>>>,
    coalesce: Duration,
}

impl ActivityLedger {
    #[must_use]
    pub fn new(db: Database, hub: Hub) -> Self {
        Self {
            db,
            hub,
            steps: Arc::new(Mutex::new(HashMap::new())),
            coalesce: Duration::from_millis(ACTIVITY_STEP_COALESCE_MS),
        }
    }

    /// Open a running activity.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn open(&self, task_type: &str, label: &str, total: Option<i64>) -> Result<ActivityHandle> {
        let id = insert_activity(self.db.pool(), task_type, label, total).await?;
        self.lock_steps().insert(
            id,
            StepState {
                last_current: None,
                last_write: None,
                pending: None,
                flush_scheduled: false,
            },
        );
        debug!(activity_id = id, task_type, "Activity opened");
        self.hub.publish(Event::new(
            Topic::Activity,
            "activity:started",
            json!({ "id": id, "task_type": task_type, "label": label, "total": total }),
        ));
        Ok(ActivityHandle {
            id,
            ledger: self.clone(),
        })
    }

    fn lock_steps(&self) -> std::sync::MutexGuard<'_, HashMap<i64, StepState>> {
        self.steps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record progress. Repeating the last `current` without details is a no-op,
    /// and so is stepping an activity that is already closed.
    ///
    /// # Errors
    ///
    /// Returns an error if an immediate store write fails. The step stays
    /// pending and is written by the next flush or by the close.
    pub async fn step(
        &self,
        id: i64,
        current: i64,
        total: Option<i64>,
        details: Option<serde_json::Value>,
    ) -> Result<()> {
        let details = details.map(|d| d.to_string());
        let step = PendingStep {
            current,
            total,
            details,
        };

        let write_now = {
            let mut steps = self.lock_steps();
            let Some(state) = steps.get_mut(&id) else {
                return Ok(());
            };
            if state.last_current == Some(current) && step.details.is_none() && step.total.is_none() {
                return Ok(());
            }
            state.last_current = Some(current);

            let due = state
                .last_write
                .map_or(true, |at| at.elapsed() >= self.coalesce);
            if due {
                state.last_write = Some(Instant::now());
                state.pending = None;
                true
            } else {
                state.pending = Some(step.clone());
                if !state.flush_scheduled {
                    state.flush_scheduled = true;
                    let wait = self.coalesce.saturating_sub(
                        state.last_write.map_or(Duration::ZERO, |at| at.elapsed()),
                    );
                    let ledger = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(wait).await;
                        if let Err(e) = ledger.flush(id).await {
                            error!(activity_id = id, "Deferred progress write failed: {e:#}");
                        }
                    });
                }
                false
            }
        };

        self.hub.publish(Event::new(
            Topic::Activity,
            "activity:progress",
            json!({ "id": id, "current": current, "total": total }),
        ));

        if write_now {
            if let Err(e) = update_activity_progress(
                self.db.pool(),
                id,
                step.current,
                step.total,
                step.details.as_deref(),
            )
            .await
            {
                if let Some(state) = self.lock_steps().get_mut(&id) {
                    state.pending.get_or_insert(step);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Write any coalesced progress for `id`.
    async fn flush(&self, id: i64) -> Result<()> {
        let pending = {
            let mut steps = self.lock_steps();
            let Some(state) = steps.get_mut(&id) else {
                return Ok(());
            };
            state.flush_scheduled = false;
            let pending = state.pending.take();
            if pending.is_some() {
                state.last_write = Some(Instant::now());
            }
            pending
        };
        if let Some(step) = pending {
            update_activity_progress(
                self.db.pool(),
                id,
                step.current,
                step.total,
                step.details.as_deref(),
            )
            .await?;
        }
        Ok(())
    }

    /// Close an activity. Closing twice is harmless; the first close wins.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn close(&self, id: i64, outcome: Outcome, error: Option<&str>) -> Result<()> {
        if let Err(e) = self.flush(id).await {
            warn!(activity_id = id, "Final progress write failed: {e:#}");
        }
        self.lock_steps().remove(&id);

        let status = outcome.status();
        let changed = finish_activity(self.db.pool(), id, status.as_str(), error).await?;
        if changed {
            info!(activity_id = id, status = status.as_str(), "Activity closed");
            self.hub.publish(Event::new(
                Topic::Activity,
                format!("activity:{}", status.as_str()),
                json!({ "id": id, "error": error }),
            ));
        }
        Ok(())
    }

    /// Pause a running activity. Returns false if it is not running.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn pause(&self, id: i64) -> Result<bool> {
        let changed = set_activity_paused(self.db.pool(), id, true).await?;
        if changed {
            self.hub.publish(Event::new(
                Topic::Activity,
                "activity:paused",
                json!({ "id": id }),
            ));
        }
        Ok(changed)
    }

    /// Resume a paused activity. Returns false if it is not running.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn resume(&self, id: i64) -> Result<bool> {
        let changed = set_activity_paused(self.db.pool(), id, false).await?;
        if changed {
            self.hub.publish(Event::new(
                Topic::Activity,
                "activity:resumed",
                json!({ "id": id }),
            ));
        }
        Ok(changed)
    }

    /// Whether the activity is currently paused.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn is_paused(&self, id: i64) -> Result<bool> {
        Ok(get_activity(self.db.pool(), id)
            .await?
            .is_some_and(|a| a.is_paused))
    }

    /// Block while the activity is paused. Returns false if cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn wait_while_paused(&self, id: i64, cancel: &CancellationToken) -> Result<bool> {
        while self.is_paused(id).await? {
            tokio::select! {
                () = cancel.cancelled() => return Ok(false),
                () = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
        Ok(!cancel.is_cancelled())
    }

    /// Get one activity.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn get(&self, id: i64) -> Result<Option<Activity>> {
        get_activity(self.db.pool(), id).await
    }

    /// List activities.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn query(&self, filter: &ActivityFilter) -> Result<Vec<Activity>> {
        list_activities(self.db.pool(), filter).await
    }

    /// Counts by status and the running set.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn status(&self) -> Result<LedgerStatus> {
        let counts = count_activities_by_status(self.db.pool()).await?;
        let running = list_activities(
            self.db.pool(),
            &ActivityFilter {
                status: Some(ActivityStatus::Running.as_str().to_string()),
                task_type: None,
                limit: Some(100),
            },
        )
        .await?;
        Ok(LedgerStatus { counts, running })
    }

    /// Delete completed and failed activities older than `days`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn clean_older_than(&self, days: i64) -> Result<u64> {
        let cutoff = format_timestamp(Utc::now() - chrono::Duration::days(days));
        let deleted = delete_activities_before(self.db.pool(), &cutoff)
            .await
            .context("Failed to clean activities")?;
        info!(deleted, days, "Cleaned old activities");
        Ok(deleted)
    }
}

/// A live activity owned by one worker invocation.
#[derive(Clone)]
pub struct ActivityHandle {
    id: i64,
    ledger: ActivityLedger,
}

impl ActivityHandle {
    #[must_use]
    pub fn id(&self) -> i64 {
        self.id
    }

    /// # Errors
    ///
    /// See [`ActivityLedger::step`].
    pub async fn step(&self, current: i64, total: Option<i64>, details: Option<serde_json::Value>) -> Result<()> {
        self.ledger.step(self.id, current, total, details).await
    }

    /// # Errors
    ///
    /// See [`ActivityLedger::close`].
    pub async fn complete(&self) -> Result<()> {
        self.ledger.close(self.id, Outcome::Completed, None).await
    }

    /// # Errors
    ///
    /// See [`ActivityLedger::close`].
    pub async fn fail(&self, error: &str) -> Result<()> {
        self.ledger.close(self.id, Outcome::Failed, Some(error)).await
    }

    /// # Errors
    ///
    /// See [`ActivityLedger::wait_while_paused`].
    pub async fn wait_while_paused(&self, cancel: &CancellationToken) -> Result<bool> {
        self.ledger.wait_while_paused(self.id, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use tempfile::TempDir;

    async fn setup() -> (ActivityLedger, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("ledger.db")).await.unwrap();
        let (hub, _) = Hub::start(&HubConfig::default(), CancellationToken::new());
        (ActivityLedger::new(db, hub), dir)
    }

    #[tokio::test]
    async fn test_open_step_close() {
        let (ledger, _dir) = setup().await;
        let handle = ledger.open("scrape_thread", "thread 1", Some(5)).await.unwrap();

        handle.step(1, None, None).await.unwrap();
        let activity = ledger.get(handle.id()).await.unwrap().unwrap();
        assert_eq!(activity.progress_current, 1);
        assert_eq!(activity.progress_total, Some(5));

        handle.step(5, None, Some(json!({"page": 5}))).await.unwrap();
        handle.complete().await.unwrap();

        let activity = ledger.get(handle.id()).await.unwrap().unwrap();
        assert_eq!(activity.status, "completed");
        assert_eq!(activity.progress_current, 5);
        assert!(activity.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_rapid_steps_are_coalesced_but_latest_lands() {
        let (ledger, _dir) = setup().await;
        let handle = ledger.open("verify_links", "batch", Some(100)).await.unwrap();

        for n in 1..=50 {
            handle.step(n, None, None).await.unwrap();
        }
        // First write went through immediately; the rest are deferred.
        let activity = ledger.get(handle.id()).await.unwrap().unwrap();
        assert_eq!(activity.progress_current, 1);

        tokio::time::sleep(Duration::from_millis(ACTIVITY_STEP_COALESCE_MS + 200)).await;
        let activity = ledger.get(handle.id()).await.unwrap().unwrap();
        assert_eq!(activity.progress_current, 50);
    }

    #[tokio::test]
    async fn test_closed_activity_is_immutable() {
        let (ledger, _dir) = setup().await;
        let handle = ledger.open("cleanup", "retention", None).await.unwrap();
        handle.fail("boom").await.unwrap();

        handle.complete().await.unwrap();
        handle.step(10, None, None).await.unwrap();
        assert!(!ledger.pause(handle.id()).await.unwrap());
        // No step state is revived for a closed activity
        assert!(!ledger.lock_steps().contains_key(&handle.id()));

        let activity = ledger.get(handle.id()).await.unwrap().unwrap();
        assert_eq!(activity.status, "failed");
        assert_eq!(activity.error.as_deref(), Some("boom"));
        assert_eq!(activity.progress_current, 0);
    }

    #[tokio::test]
    async fn test_failed_progress_write_does_not_block_close() {
        let (ledger, _dir) = setup().await;
        let handle = ledger.open("verify_links", "batch", Some(3)).await.unwrap();
        sqlx::query(
            "CREATE TRIGGER reject_progress BEFORE UPDATE OF progress_current ON activities \
             BEGIN SELECT RAISE(ABORT, 'disk full'); END",
        )
        .execute(ledger.db.pool())
        .await
        .unwrap();

        assert!(handle.step(3, None, None).await.is_err());
        handle.complete().await.unwrap();

        let activity = ledger.get(handle.id()).await.unwrap().unwrap();
        assert_eq!(activity.status, "completed");
        assert_eq!(activity.progress_current, 0);
    }

    #[tokio::test]
    async fn test_pause_resume() {
        let (ledger, _dir) = setup().await;
        let handle = ledger.open("scrape_forum", "forum", None).await.unwrap();

        assert!(ledger.pause(handle.id()).await.unwrap());
        assert!(ledger.is_paused(handle.id()).await.unwrap());
        assert!(ledger.resume(handle.id()).await.unwrap());
        assert!(!ledger.is_paused(handle.id()).await.unwrap());

        let cancel = CancellationToken::new();
        assert!(handle.wait_while_paused(&cancel).await.unwrap());
    }

    #[tokio::test]
    async fn test_clean_older_than_keeps_running() {
        let (ledger, _dir) = setup().await;
        let done = ledger.open("a", "done", None).await.unwrap();
        done.complete().await.unwrap();
        let running = ledger.open("b", "running", None).await.unwrap();

        // Zero-day retention removes every finished activity
        tokio::time::sleep(Duration::from_millis(5)).await;
        let deleted = ledger.clean_older_than(0).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(ledger.get(done.id()).await.unwrap().is_none());
        assert!(ledger.get(running.id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_query_filters() {
        let (ledger, _dir) = setup().await;
        ledger.open("scrape_thread", "one", None).await.unwrap();
        let two = ledger.open("verify_links", "two", None).await.unwrap();
        two.complete().await.unwrap();

        let filter = ActivityFilter {
            status: Some("completed".to_string()),
            task_type: None,
            limit: None,
        };
        let rows = ledger.query(&filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].label, "two");

        let status = ledger.status().await.unwrap();
        assert_eq!(status.running.len(), 1);
        assert_eq!(status.counts.get("completed"), Some(&1));
    }
}
