//! Persistent job scheduler.
//!
//! Every tick selects enabled jobs whose `next_run_at` has passed, claims each
//! one with a compare-and-set lease, and hands it to the typed worker for its
//! kind. A claim whose lease runs out is treated as a crashed run: the next
//! tick re-claims the job and fails the orphaned execution.

pub mod schedule;
pub mod workers;

pub use schedule::{backoff_delay, jittered_backoff, Schedule, ScheduleConfig, ScheduleError};
pub use workers::{JobContext, JobWorker, Task, WorkerError, WorkerRegistry};

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::db::{
    self, claim_job, close_execution, extend_claim, fail_orphaned_executions, finish_job_run,
    format_timestamp, get_due_jobs, get_job, insert_job, job_history, list_jobs,
    open_execution, parse_timestamp, save_job_definition, Database, JobExecution, JobKind,
    JobRunOutcome, NewJob, RunStatus, ScheduleKind, ScheduledJob,
};
use crate::hub::{Event, Hub, Topic};

/// Once-jobs are given up after this many consecutive transient failures.
const MAX_ONCE_ATTEMPTS: i64 = 3;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("job {0} not found")]
    NotFound(i64),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<ScheduleError> for SchedulerError {
    fn from(e: ScheduleError) -> Self {
        Self::InvalidArgument(e.to_string())
    }
}

/// Body of a job creation request.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    pub job_type: String,
    pub schedule_type: String,
    #[serde(default)]
    pub schedule_config: ScheduleConfig,
    #[serde(default)]
    pub target_type: Option<String>,
    #[serde(default)]
    pub target_id: Option<i64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Partial update; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobPatch {
    pub job_type: Option<String>,
    pub schedule_type: Option<String>,
    pub schedule_config: Option<ScheduleConfig>,
    pub target_type: Option<String>,
    pub target_id: Option<i64>,
    pub enabled: Option<bool>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    db: Database,
    hub: Hub,
    registry: WorkerRegistry,
    config: SchedulerConfig,
    /// Cancellation handles of runs owned by this process, by job ID.
    running: RwLock<HashMap<i64, CancellationToken>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        db: Database,
        hub: Hub,
        registry: WorkerRegistry,
        config: SchedulerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                hub,
                registry,
                config,
                running: RwLock::new(HashMap::new()),
                tasks: TaskTracker::new(),
                shutdown,
            }),
        }
    }

    // ========== Lifecycle ==========

    /// Spawn the tick loop. It exits when the shutdown token fires.
    #[must_use]
    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.tick_loop().await })
    }

    async fn tick_loop(&self) {
        let mut interval = tokio::time::interval(self.inner.config.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            tick_ms = self.inner.config.tick_interval_ms,
            lease_secs = self.inner.config.lease_secs,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                () = self.inner.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.tick().await {
                error!("Scheduler tick failed: {e:#}");
            }
        }
        info!("Scheduler tick loop stopped");
    }

    /// Cancel running jobs and wait up to the grace period for them to finish.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        let running = self.inner.running.read().await.len();
        if running > 0 {
            info!(count = running, "Waiting for running jobs to finish");
        }
        // Each run already bounds its own wait; the extra second covers bookkeeping
        let grace = self.inner.config.shutdown_grace() + Duration::from_secs(1);
        if tokio::time::timeout(grace, self.inner.tasks.wait()).await.is_err() {
            warn!("Scheduler stopped with jobs still running");
        }
    }

    /// One scheduler iteration. Returns the IDs of the jobs it dispatched.
    ///
    /// # Errors
    ///
    /// Returns an error if the due-job query fails.
    pub async fn tick(&self) -> Result<Vec<i64>> {
        let now = Utc::now();
        let now_str = format_timestamp(now);
        let due = get_due_jobs(self.inner.db.pool(), &now_str, self.inner.config.batch_size).await?;
        let mut dispatched = Vec::new();

        for job in due {
            if self.inner.shutdown.is_cancelled() {
                break;
            }
            if self.inner.running.read().await.contains_key(&job.id) {
                continue;
            }

            let token = Uuid::new_v4().to_string();
            let expires = format_timestamp(now + to_chrono(self.inner.config.lease()));
            match claim_job(self.inner.db.pool(), job.id, &token, &now_str, &expires).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(job_id = job.id, "Job claimed elsewhere");
                    continue;
                }
                Err(e) => {
                    warn!(job_id = job.id, "Failed to claim job: {e:#}");
                    continue;
                }
            }

            if job.claim_token.is_some() {
                // The previous holder let its lease lapse
                match fail_orphaned_executions(self.inner.db.pool(), job.id, "lease expired").await {
                    Ok(n) if n > 0 => warn!(job_id = job.id, orphaned = n, "Recovered job after lease expiry"),
                    Ok(_) => {}
                    Err(e) => warn!(job_id = job.id, "Failed to close orphaned executions: {e:#}"),
                }
            }

            let cancel = self.inner.shutdown.child_token();
            self.inner
                .running
                .write()
                .await
                .insert(job.id, cancel.clone());
            dispatched.push(job.id);

            let scheduler = self.clone();
            self.inner.tasks.spawn(async move {
                let job_id = job.id;
                scheduler.run_claimed(job, token, cancel).await;
                scheduler.inner.running.write().await.remove(&job_id);
            });
        }

        Ok(dispatched)
    }

    /// Wait until no job run owned by this process is in flight.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.inner.running.read().await.is_empty() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.inner.running.read().await.is_empty()
    }

    // ========== Job API ==========

    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidArgument`] for unknown kinds or bad schedules.
    pub async fn create_job(&self, request: JobRequest) -> Result<ScheduledJob, SchedulerError> {
        let (kind, schedule_kind, schedule) =
            validate(&request.job_type, &request.schedule_type, &request.schedule_config)?;
        check_target(kind, request.target_type.as_deref(), request.target_id)?;

        let next_run_at = schedule.first_run(Utc::now()).map(format_timestamp);
        let id = insert_job(
            self.inner.db.pool(),
            &NewJob {
                job_type: kind.as_str().to_string(),
                schedule_type: schedule_kind.as_str().to_string(),
                schedule_config: request.schedule_config.to_json(),
                target_type: request.target_type,
                target_id: request.target_id,
                enabled: request.enabled,
                next_run_at,
            },
        )
        .await?;

        info!(job_id = id, job_type = kind.as_str(), schedule = schedule_kind.as_str(), "Created job");
        self.job(id).await
    }

    /// Queue a one-shot job that runs on the next tick. A target, when given,
    /// is a thread ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the job cannot be stored.
    pub async fn enqueue_once(
        &self,
        kind: JobKind,
        thread_id: Option<i64>,
        config: ScheduleConfig,
    ) -> Result<ScheduledJob, SchedulerError> {
        self.create_job(JobRequest {
            job_type: kind.as_str().to_string(),
            schedule_type: ScheduleKind::Once.as_str().to_string(),
            schedule_config: ScheduleConfig {
                run_at: None,
                ..config
            },
            target_type: thread_id.map(|_| "thread".to_string()),
            target_id: thread_id,
            enabled: true,
        })
        .await
    }

    /// Apply a partial update. A changed schedule or re-enabling recomputes
    /// `next_run_at`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`] or [`SchedulerError::InvalidArgument`].
    pub async fn update_job(&self, id: i64, patch: JobPatch) -> Result<ScheduledJob, SchedulerError> {
        let mut job = self.job(id).await?;
        let was_enabled = job.enabled;
        let schedule_changed = patch.schedule_type.is_some() || patch.schedule_config.is_some();

        if let Some(job_type) = patch.job_type {
            job.job_type = job_type;
        }
        if let Some(schedule_type) = patch.schedule_type {
            job.schedule_type = schedule_type;
        }
        let config = match patch.schedule_config {
            Some(config) => config,
            None => ScheduleConfig::from_json(&job.schedule_config)?,
        };
        if patch.target_type.is_some() {
            job.target_type = patch.target_type;
        }
        if patch.target_id.is_some() {
            job.target_id = patch.target_id;
        }
        if let Some(enabled) = patch.enabled {
            job.enabled = enabled;
        }

        let (kind, schedule_kind, schedule) = validate(&job.job_type, &job.schedule_type, &config)?;
        check_target(kind, job.target_type.as_deref(), job.target_id)?;
        job.job_type = kind.as_str().to_string();
        job.schedule_type = schedule_kind.as_str().to_string();
        job.schedule_config = config.to_json();

        if schedule_changed || (job.enabled && !was_enabled) || job.next_run_at.is_none() {
            job.next_run_at = schedule.first_run(Utc::now()).map(format_timestamp);
        }

        if !save_job_definition(self.inner.db.pool(), &job).await? {
            return Err(SchedulerError::NotFound(id));
        }
        info!(job_id = id, "Updated job");
        self.job(id).await
    }

    /// Flip `enabled`. Enabling schedules the next run from now.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`] for unknown IDs.
    pub async fn toggle_job(&self, id: i64) -> Result<ScheduledJob, SchedulerError> {
        let mut job = self.job(id).await?;
        job.enabled = !job.enabled;
        if job.enabled {
            let config = ScheduleConfig::from_json(&job.schedule_config)?;
            let schedule_kind = job
                .schedule_kind()
                .ok_or_else(|| SchedulerError::InvalidArgument(format!("unknown schedule type '{}'", job.schedule_type)))?;
            job.next_run_at = Schedule::parse(schedule_kind, &config)?
                .first_run(Utc::now())
                .map(format_timestamp);
        } else {
            job.next_run_at = None;
        }

        if !save_job_definition(self.inner.db.pool(), &job).await? {
            return Err(SchedulerError::NotFound(id));
        }
        info!(job_id = id, enabled = job.enabled, "Toggled job");
        self.job(id).await
    }

    /// Delete a job and its history, cancelling a run in progress.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`] for unknown IDs.
    pub async fn delete_job(&self, id: i64) -> Result<(), SchedulerError> {
        if let Some(cancel) = self.inner.running.read().await.get(&id) {
            cancel.cancel();
        }
        if !db::delete_job(self.inner.db.pool(), id).await? {
            return Err(SchedulerError::NotFound(id));
        }
        info!(job_id = id, "Deleted job");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the store query fails.
    pub async fn jobs(&self) -> Result<Vec<ScheduledJob>, SchedulerError> {
        Ok(list_jobs(self.inner.db.pool()).await?)
    }

    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`] for unknown IDs.
    pub async fn job(&self, id: i64) -> Result<ScheduledJob, SchedulerError> {
        get_job(self.inner.db.pool(), id)
            .await?
            .ok_or(SchedulerError::NotFound(id))
    }

    /// Most recent executions of a job, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotFound`] for unknown IDs.
    pub async fn history(&self, id: i64, limit: i64) -> Result<Vec<JobExecution>, SchedulerError> {
        self.job(id).await?;
        Ok(job_history(self.inner.db.pool(), id, limit.clamp(1, 500)).await?)
    }

    // ========== Execution ==========

    async fn run_claimed(&self, job: ScheduledJob, token: String, cancel: CancellationToken) {
        let pool = self.inner.db.pool();
        let started = Instant::now();
        let started_at = Utc::now();

        let execution_id = match open_execution(pool, job.id, &format_timestamp(started_at)).await {
            Ok(id) => id,
            Err(e) => {
                error!(job_id = job.id, "Failed to open execution: {e:#}");
                if let Err(e) = db::release_claim(pool, job.id, &token).await {
                    warn!(job_id = job.id, "Failed to release claim: {e:#}");
                }
                return;
            }
        };

        info!(job_id = job.id, job_type = %job.job_type, execution_id, "Job started");
        self.inner.hub.publish(Event::new(
            Topic::Job,
            "job:started",
            json!({ "job_id": job.id, "job_type": job.job_type, "execution_id": execution_id }),
        ));

        let schedule = parse_schedule(&job);
        let result = match &schedule {
            Ok(_) => self.execute(&job, &token, cancel.clone()).await,
            Err(e) => Err(WorkerError::Permanent(e.to_string())),
        };
        let result = match result {
            Err(_) if cancel.is_cancelled() => Err(WorkerError::Cancelled),
            other => other,
        };

        let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        let now = Utc::now();
        let outcome = plan_outcome(&job, schedule.as_ref().ok(), &result, now, &self.inner.config);

        let (status, error, stats) = match &result {
            Ok(stats) => (RunStatus::Ok, None, Some(stats.to_string())),
            Err(e) => (RunStatus::Failed, Some(e.to_string()), None),
        };
        if let Err(e) = close_execution(
            pool,
            execution_id,
            status,
            error.as_deref(),
            stats.as_deref(),
            duration_ms,
        )
        .await
        {
            error!(job_id = job.id, execution_id, "Failed to close execution: {e:#}");
        }

        match finish_job_run(pool, job.id, &token, &outcome).await {
            Ok(true) => {}
            Ok(false) => warn!(job_id = job.id, "Lost claim before recording the run"),
            Err(e) => error!(job_id = job.id, "Failed to record job run: {e:#}"),
        }

        let payload = json!({
            "job_id": job.id,
            "job_type": job.job_type,
            "execution_id": execution_id,
            "duration_ms": duration_ms,
            "next_run_at": outcome.next_run_at,
            "error": error,
        });
        match &result {
            Ok(_) => {
                info!(job_id = job.id, duration_ms, next_run_at = ?outcome.next_run_at, "Job completed");
                self.inner.hub.publish(Event::new(Topic::Job, "job:completed", payload));
            }
            Err(e) => {
                warn!(job_id = job.id, duration_ms, error = %e, next_run_at = ?outcome.next_run_at, "Job failed");
                self.inner.hub.publish(Event::new(Topic::Job, "job:failed", payload));
            }
        }
    }

    /// Run the worker on its own task, extending the lease while it works.
    async fn execute(
        &self,
        job: &ScheduledJob,
        token: &str,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, WorkerError> {
        let config = ScheduleConfig::from_json(&job.schedule_config)
            .map_err(|e| WorkerError::Permanent(e.to_string()))?;
        let task = Task::from_job(job, &config)?;
        let worker = self
            .inner
            .registry
            .get(task.kind())
            .ok_or_else(|| WorkerError::Permanent(format!("no worker for '{}'", job.job_type)))?;

        let ctx = JobContext {
            job_id: job.id,
            task,
            cancel: cancel.clone(),
        };
        install_panic_hook();
        let job_id = job.id;
        let mut handle = tokio::spawn(async move {
            match AssertUnwindSafe(worker.run(&ctx)).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => {
                    let message = panic_message(payload);
                    let trace = take_panic_trace().unwrap_or_default();
                    error!(job_id, panic = %message, "Worker panicked\n{trace}");
                    Err(WorkerError::Permanent(format!("worker panicked: {message}\n{trace}")))
                }
            }
        });

        let lease = self.inner.config.lease();
        let mut heartbeat = tokio::time::interval((lease / 3).max(Duration::from_millis(100)));
        heartbeat.tick().await;

        let joined = loop {
            tokio::select! {
                joined = &mut handle => break joined,
                () = cancel.cancelled() => {
                    match tokio::time::timeout(self.inner.config.shutdown_grace(), &mut handle).await {
                        Ok(joined) => break joined,
                        Err(_) => {
                            warn!(job_id = job.id, "Worker ignored cancellation; aborting");
                            handle.abort();
                            return Err(WorkerError::Cancelled);
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    let expires = format_timestamp(Utc::now() + to_chrono(lease));
                    match extend_claim(self.inner.db.pool(), job.id, token, &expires).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(job_id = job.id, "Lease lost; cancelling worker");
                            cancel.cancel();
                        }
                        Err(e) => warn!(job_id = job.id, "Failed to extend lease: {e:#}"),
                    }
                }
            }
        };

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(job_id = job.id, panic = %message, "Worker panicked");
                Err(WorkerError::Permanent(format!("worker panicked: {message}")))
            }
            Err(_) => Err(WorkerError::Cancelled),
        }
    }
}

fn validate(
    job_type: &str,
    schedule_type: &str,
    config: &ScheduleConfig,
) -> Result<(JobKind, ScheduleKind, Schedule), SchedulerError> {
    let kind = JobKind::from_str(job_type)
        .ok_or_else(|| SchedulerError::InvalidArgument(format!("unknown job type '{job_type}'")))?;
    let schedule_kind = ScheduleKind::from_str(schedule_type).ok_or_else(|| {
        SchedulerError::InvalidArgument(format!("unknown schedule type '{schedule_type}'"))
    })?;
    let schedule = Schedule::parse(schedule_kind, config)?;
    Ok((kind, schedule_kind, schedule))
}

fn check_target(kind: JobKind, target_type: Option<&str>, target_id: Option<i64>) -> Result<(), SchedulerError> {
    if let Some(t) = target_type {
        if t != "thread" {
            return Err(SchedulerError::InvalidArgument(format!("unsupported target type '{t}'")));
        }
    }
    if kind == JobKind::ScrapeThread && target_id.is_none() {
        return Err(SchedulerError::InvalidArgument(
            "scrape_thread jobs need a target_id".to_string(),
        ));
    }
    Ok(())
}

fn parse_schedule(job: &ScheduledJob) -> Result<Schedule, ScheduleError> {
    let kind = job
        .schedule_kind()
        .ok_or_else(|| ScheduleError::Config(format!("unknown schedule type '{}'", job.schedule_type)))?;
    Schedule::parse(kind, &ScheduleConfig::from_json(&job.schedule_config)?)
}

/// Bookkeeping for a finished run.
///
/// Success resets the failure count and advances along the schedule (once-jobs
/// are disabled). Failure backs off by `min(base * 2^k, cap)` with jitter;
/// once-jobs give up on permanent errors or after [`MAX_ONCE_ATTEMPTS`].
/// Cancellation leaves the schedule as it was so the run repeats after restart.
fn plan_outcome(
    job: &ScheduledJob,
    schedule: Option<&Schedule>,
    result: &Result<serde_json::Value, WorkerError>,
    now: DateTime<Utc>,
    config: &SchedulerConfig,
) -> JobRunOutcome {
    let is_once = schedule.map_or(job.schedule_type == "once", Schedule::is_once);
    let mut outcome = JobRunOutcome {
        status: RunStatus::Ok,
        error: None,
        last_run_at: format_timestamp(now),
        next_run_at: None,
        enabled: true,
        consecutive_failures: 0,
    };

    match result {
        Ok(_) => {
            let anchor = job
                .next_run_at
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or(now);
            outcome.next_run_at = schedule
                .and_then(|s| s.next_after(anchor, now))
                .map(format_timestamp);
            outcome.enabled = outcome.next_run_at.is_some();
        }
        Err(WorkerError::Cancelled) => {
            outcome.status = RunStatus::Failed;
            outcome.error = Some(WorkerError::Cancelled.to_string());
            outcome.next_run_at.clone_from(&job.next_run_at);
            outcome.consecutive_failures = job.consecutive_failures;
        }
        Err(e) => {
            let failures = job.consecutive_failures + 1;
            outcome.status = RunStatus::Failed;
            outcome.error = Some(e.to_string());
            outcome.consecutive_failures = failures;

            if is_once && (e.is_permanent() || failures >= MAX_ONCE_ATTEMPTS) {
                outcome.enabled = false;
            } else {
                let delay = jittered_backoff(
                    job.consecutive_failures,
                    Duration::from_secs(config.backoff_base_secs),
                    Duration::from_secs(config.backoff_cap_secs),
                );
                outcome.next_run_at = Some(format_timestamp(now + to_chrono(delay)));
            }
        }
    }
    outcome
}

thread_local! {
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Keep the backtrace of the latest panic on each thread, then hand off to
/// the previous hook.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn take_panic_trace() -> Option<String> {
    PANIC_TRACE.with(|slot| slot.borrow_mut().take())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(1))
}
