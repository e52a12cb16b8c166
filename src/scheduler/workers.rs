//! Typed job workers and the registry the scheduler dispatches through.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::schedule::ScheduleConfig;
use crate::activity::{ActivityHandle, ActivityLedger};
use crate::db::{
    delete_audit_logs_before, delete_executions_before, delete_finished_once_jobs, format_timestamp,
    Database, JobKind, ScheduledJob,
};
use crate::net::FetchError;
use crate::scraper::Scraper;
use crate::verifier::Verifier;

const DEFAULT_ACTIVITY_RETENTION_DAYS: i64 = 30;
const DEFAULT_AUDIT_RETENTION_DAYS: i64 = 90;
const DEFAULT_VERIFY_LIMIT: i64 = 500;

/// How a worker run failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Worth retrying on the next backoff slot.
    #[error("{0}")]
    Transient(String),
    /// Retrying will not help.
    #[error("{0}")]
    Permanent(String),
    #[error("cancelled")]
    Cancelled,
}

impl WorkerError {
    /// Classify an error chain: retryable fetch failures are transient,
    /// cancellations are cancellations, everything else is permanent.
    #[must_use]
    pub fn classify(err: &anyhow::Error) -> Self {
        let message = format!("{err:#}");
        for cause in err.chain() {
            if let Some(fetch) = cause.downcast_ref::<FetchError>() {
                return match fetch {
                    FetchError::Cancelled => Self::Cancelled,
                    e if e.is_retryable() => Self::Transient(message),
                    _ => Self::Permanent(message),
                };
            }
            if cause.downcast_ref::<sqlx::Error>().is_some() {
                return Self::Transient(message);
            }
        }
        Self::Permanent(message)
    }

    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// The unit of work a job describes, with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    ScrapeThread { thread_id: i64 },
    VerifyLinks {
        thread_id: Option<i64>,
        limit: i64,
        cutoff_days: Option<i64>,
    },
    CleanupActivities { retention_days: i64 },
    CleanupAudit { retention_days: i64 },
}

impl Task {
    /// Build the task for a stored job.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Permanent`] for unknown kinds or missing targets.
    pub fn from_job(job: &ScheduledJob, config: &ScheduleConfig) -> Result<Self, WorkerError> {
        let kind = job
            .kind()
            .ok_or_else(|| WorkerError::Permanent(format!("unknown job type '{}'", job.job_type)))?;
        let thread_target = || {
            job.target_id
                .filter(|_| job.target_type.as_deref().map_or(true, |t| t == "thread"))
        };
        Ok(match kind {
            JobKind::ScrapeThread => Self::ScrapeThread {
                thread_id: thread_target().ok_or_else(|| {
                    WorkerError::Permanent("scrape_thread job has no thread target".to_string())
                })?,
            },
            JobKind::VerifyLinks => Self::VerifyLinks {
                thread_id: thread_target(),
                limit: config.limit.unwrap_or(DEFAULT_VERIFY_LIMIT).max(1),
                cutoff_days: config.cutoff_days,
            },
            JobKind::CleanupActivities => Self::CleanupActivities {
                retention_days: config
                    .retention_days
                    .unwrap_or(DEFAULT_ACTIVITY_RETENTION_DAYS),
            },
            JobKind::CleanupAudit => Self::CleanupAudit {
                retention_days: config.retention_days.unwrap_or(DEFAULT_AUDIT_RETENTION_DAYS),
            },
        })
    }

    #[must_use]
    pub fn kind(&self) -> JobKind {
        match self {
            Self::ScrapeThread { .. } => JobKind::ScrapeThread,
            Self::VerifyLinks { .. } => JobKind::VerifyLinks,
            Self::CleanupActivities { .. } => JobKind::CleanupActivities,
            Self::CleanupAudit { .. } => JobKind::CleanupAudit,
        }
    }
}

/// Everything a worker gets for one run.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: i64,
    pub task: Task,
    /// Fires on scheduler stop or lease loss.
    pub cancel: CancellationToken,
}

/// Executes one kind of task. Returns free-form stats for the execution row.
#[async_trait]
pub trait JobWorker: Send + Sync {
    async fn run(&self, ctx: &JobContext) -> Result<serde_json::Value, WorkerError>;
}

/// Maps job kinds to workers.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: HashMap<JobKind, Arc<dyn JobWorker>>,
}

impl WorkerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: JobKind, worker: Arc<dyn JobWorker>) {
        self.workers.insert(kind, worker);
    }

    #[must_use]
    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobWorker>> {
        self.workers.get(&kind).cloned()
    }

    /// Registry with the built-in workers for every job kind.
    #[must_use]
    pub fn with_defaults(db: Database, ledger: ActivityLedger, scraper: Scraper, verifier: Verifier, default_ttl_days: i64) -> Self {
        let mut registry = Self::new();
        registry.register(JobKind::ScrapeThread, Arc::new(ScrapeThreadWorker { scraper }));
        registry.register(
            JobKind::VerifyLinks,
            Arc::new(VerifyLinksWorker {
                verifier,
                default_ttl_days,
            }),
        );
        registry.register(
            JobKind::CleanupActivities,
            Arc::new(CleanupActivitiesWorker {
                db: db.clone(),
                ledger: ledger.clone(),
            }),
        );
        registry.register(JobKind::CleanupAudit, Arc::new(CleanupAuditWorker { db, ledger }));
        registry
    }
}

fn stats<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

// ========== Built-in workers ==========

pub struct ScrapeThreadWorker {
    scraper: Scraper,
}

#[async_trait]
impl JobWorker for ScrapeThreadWorker {
    async fn run(&self, ctx: &JobContext) -> Result<serde_json::Value, WorkerError> {
        let Task::ScrapeThread { thread_id } = ctx.task else {
            return Err(WorkerError::Permanent("scrape worker got another task".to_string()));
        };
        let report = self
            .scraper
            .scrape_thread_id(thread_id, &ctx.cancel)
            .await
            .map_err(|e| WorkerError::classify(&e))?;
        Ok(stats(&report))
    }
}

pub struct VerifyLinksWorker {
    verifier: Verifier,
    default_ttl_days: i64,
}

#[async_trait]
impl JobWorker for VerifyLinksWorker {
    async fn run(&self, ctx: &JobContext) -> Result<serde_json::Value, WorkerError> {
        let Task::VerifyLinks {
            thread_id,
            limit,
            cutoff_days,
        } = ctx.task
        else {
            return Err(WorkerError::Permanent("verify worker got another task".to_string()));
        };
        let report = match thread_id {
            Some(id) => self.verifier.verify_thread(id, &ctx.cancel).await,
            None => {
                self.verifier
                    .verify_stale(cutoff_days.unwrap_or(self.default_ttl_days), limit, &ctx.cancel)
                    .await
            }
        }
        .map_err(|e| WorkerError::classify(&e))?;
        if ctx.cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }
        Ok(stats(&report))
    }
}

pub struct CleanupActivitiesWorker {
    db: Database,
    ledger: ActivityLedger,
}

#[async_trait]
impl JobWorker for CleanupActivitiesWorker {
    async fn run(&self, ctx: &JobContext) -> Result<serde_json::Value, WorkerError> {
        let Task::CleanupActivities { retention_days } = ctx.task else {
            return Err(WorkerError::Permanent("cleanup worker got another task".to_string()));
        };
        let activity = self
            .ledger
            .open("cleanup_activities", &format!("Delete activities older than {retention_days}d"), Some(3))
            .await
            .map_err(|e| WorkerError::classify(&e))?;

        let result = async {
            let activities = self.ledger.clean_older_than(retention_days).await?;
            step(&activity, 1, 3).await;
            let cutoff = format_timestamp(Utc::now() - chrono::Duration::days(retention_days.max(0)));
            let executions = delete_executions_before(self.db.pool(), &cutoff).await?;
            step(&activity, 2, 3).await;
            let jobs = delete_finished_once_jobs(self.db.pool(), &cutoff).await?;
            step(&activity, 3, 3).await;
            anyhow::Ok(json!({
                "activities_deleted": activities,
                "executions_deleted": executions,
                "once_jobs_deleted": jobs,
            }))
        }
        .await;

        finish(&activity, result).await
    }
}

pub struct CleanupAuditWorker {
    db: Database,
    ledger: ActivityLedger,
}

#[async_trait]
impl JobWorker for CleanupAuditWorker {
    async fn run(&self, ctx: &JobContext) -> Result<serde_json::Value, WorkerError> {
        let Task::CleanupAudit { retention_days } = ctx.task else {
            return Err(WorkerError::Permanent("audit worker got another task".to_string()));
        };
        let activity = self
            .ledger
            .open("cleanup_audit", &format!("Delete audit logs older than {retention_days}d"), Some(1))
            .await
            .map_err(|e| WorkerError::classify(&e))?;

        let result = async {
            let cutoff = format_timestamp(Utc::now() - chrono::Duration::days(retention_days.max(0)));
            let deleted = delete_audit_logs_before(self.db.pool(), &cutoff).await?;
            step(&activity, 1, 1).await;
            anyhow::Ok(json!({ "audit_logs_deleted": deleted }))
        }
        .await;

        finish(&activity, result).await
    }
}

async fn step(activity: &ActivityHandle, current: i64, total: i64) {
    if let Err(e) = activity.step(current, Some(total), None).await {
        warn!(activity_id = activity.id(), "Failed to record cleanup progress: {e:#}");
    }
}

/// Close the activity for `result`. A close failure is logged; the run's own
/// outcome is what gets returned.
async fn finish(
    activity: &ActivityHandle,
    result: anyhow::Result<serde_json::Value>,
) -> Result<serde_json::Value, WorkerError> {
    let (closed, outcome) = match result {
        Ok(value) => (activity.complete().await, Ok(value)),
        Err(e) => {
            let err = WorkerError::classify(&e);
            (activity.fail(&err.to_string()).await, Err(err))
        }
    };
    if let Err(e) = closed {
        warn!(activity_id = activity.id(), "Failed to close cleanup activity: {e:#}");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::hub::Hub;
    use tempfile::TempDir;

    fn job(job_type: &str, target_type: Option<&str>, target_id: Option<i64>) -> ScheduledJob {
        ScheduledJob {
            id: 1,
            job_type: job_type.to_string(),
            schedule_type: "once".to_string(),
            schedule_config: "{}".to_string(),
            target_type: target_type.map(str::to_string),
            target_id,
            enabled: true,
            last_run_at: None,
            next_run_at: None,
            last_status: None,
            last_error: None,
            consecutive_failures: 0,
            run_count: 0,
            success_count: 0,
            failure_count: 0,
            claim_token: None,
            claim_expires_at: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_task_from_job() {
        let config = ScheduleConfig::default();
        assert_eq!(
            Task::from_job(&job("scrape_thread", Some("thread"), Some(7)), &config),
            Ok(Task::ScrapeThread { thread_id: 7 })
        );
        assert_eq!(
            Task::from_job(&job("verify_links", None, None), &config),
            Ok(Task::VerifyLinks {
                thread_id: None,
                limit: DEFAULT_VERIFY_LIMIT,
                cutoff_days: None,
            })
        );
        assert_eq!(
            Task::from_job(&job("cleanup_old_activities", None, None), &config),
            Ok(Task::CleanupActivities {
                retention_days: DEFAULT_ACTIVITY_RETENTION_DAYS
            })
        );
    }

    #[test]
    fn test_unknown_kind_and_missing_target_are_permanent() {
        let config = ScheduleConfig::default();
        assert!(Task::from_job(&job("reindex_everything", None, None), &config)
            .unwrap_err()
            .is_permanent());
        assert!(Task::from_job(&job("scrape_thread", None, None), &config)
            .unwrap_err()
            .is_permanent());
        assert!(Task::from_job(&job("scrape_thread", Some("performer"), Some(3)), &config)
            .unwrap_err()
            .is_permanent());
    }

    #[test]
    fn test_classify_fetch_errors() {
        let transient = anyhow::Error::new(FetchError::Status {
            status: 503,
            url: "https://forum.example/t/1".to_string(),
        })
        .context("Failed to fetch page 2");
        assert!(matches!(WorkerError::classify(&transient), WorkerError::Transient(_)));

        let permanent = anyhow::Error::new(FetchError::Status {
            status: 404,
            url: "https://forum.example/t/1".to_string(),
        });
        assert!(WorkerError::classify(&permanent).is_permanent());

        let cancelled = anyhow::Error::new(FetchError::Cancelled);
        assert_eq!(WorkerError::classify(&cancelled), WorkerError::Cancelled);

        assert!(WorkerError::classify(&anyhow::anyhow!("Thread 9 not found")).is_permanent());
    }

    #[tokio::test]
    async fn test_close_failure_keeps_run_outcome() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("workers.db")).await.unwrap();
        let (hub, _) = Hub::start(&HubConfig::default(), CancellationToken::new());
        let ledger = ActivityLedger::new(db.clone(), hub);
        let activity = ledger.open("cleanup_audit", "retention", Some(1)).await.unwrap();
        sqlx::query(
            "CREATE TRIGGER reject_close BEFORE UPDATE OF status ON activities \
             BEGIN SELECT RAISE(ABORT, 'disk full'); END",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let err = finish(&activity, Err(anyhow::anyhow!("Thread 9 not found")))
            .await
            .unwrap_err();
        assert_eq!(err, WorkerError::Permanent("Thread 9 not found".to_string()));

        let value = finish(&activity, Ok(json!({ "audit_logs_deleted": 2 }))).await.unwrap();
        assert_eq!(value["audit_logs_deleted"], 2);

        let row = ledger.get(activity.id()).await.unwrap().unwrap();
        assert_eq!(row.status, "running");
    }
}
