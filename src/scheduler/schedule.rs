//! Schedule definitions and next-run arithmetic.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::{parse_timestamp, ScheduleKind};
use crate::net::jittered;

/// Stored as JSON in `scheduled_jobs.schedule_config`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_minutes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<String>,
    /// Cleanup jobs: delete records older than this many days.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<i64>,
    /// Verification jobs: links per run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    /// Verification jobs: re-check links not checked for this many days.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cutoff_days: Option<i64>,
}

impl ScheduleConfig {
    /// Parse a stored config. An empty string is an empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Config`] for malformed JSON.
    pub fn from_json(raw: &str) -> Result<Self, ScheduleError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw).map_err(|e| ScheduleError::Config(e.to_string()))
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid schedule config: {0}")]
    Config(String),
    #[error("interval schedules need interval_minutes > 0")]
    MissingInterval,
    #[error("cron schedules need a cron expression")]
    MissingCron,
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },
    #[error("invalid run_at timestamp '{0}'")]
    InvalidRunAt(String),
}

/// A parsed, validated schedule.
#[derive(Debug, Clone)]
pub enum Schedule {
    Interval(Duration),
    Cron(Box<cron::Schedule>),
    /// Run once at the given instant (or as soon as possible when `None`).
    Once(Option<DateTime<Utc>>),
}

impl Schedule {
    /// # Errors
    ///
    /// Returns a [`ScheduleError`] when the config does not fit the kind.
    pub fn parse(kind: ScheduleKind, config: &ScheduleConfig) -> Result<Self, ScheduleError> {
        match kind {
            ScheduleKind::Interval => match config.interval_minutes {
                Some(minutes) if minutes > 0 => Ok(Self::Interval(Duration::from_secs(minutes * 60))),
                _ => Err(ScheduleError::MissingInterval),
            },
            ScheduleKind::Cron => {
                let expr = config
                    .cron
                    .as_deref()
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .ok_or(ScheduleError::MissingCron)?;
                parse_cron(expr).map(|s| Self::Cron(Box::new(s)))
            }
            ScheduleKind::Once => match config.run_at.as_deref() {
                None | Some("") => Ok(Self::Once(None)),
                Some(raw) => parse_timestamp(raw)
                    .map(|at| Self::Once(Some(at)))
                    .ok_or_else(|| ScheduleError::InvalidRunAt(raw.to_string())),
            },
        }
    }

    /// First run for a newly created or re-enabled job.
    #[must_use]
    pub fn first_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval(every) => Some(now + to_chrono(*every)),
            Self::Cron(schedule) => schedule.after(&now).next(),
            Self::Once(at) => Some(at.map_or(now, |at| at.max(now))),
        }
    }

    /// Next run after a successful run.
    ///
    /// `anchor` is the slot the run was scheduled for; interval jobs keep that
    /// cadence but never schedule into the past. `None` means the job is done.
    #[must_use]
    pub fn next_after(&self, anchor: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval(every) => Some((anchor + to_chrono(*every)).max(now)),
            Self::Cron(schedule) => schedule.after(&anchor).next(),
            Self::Once(_) => None,
        }
    }

    #[must_use]
    pub fn is_once(&self) -> bool {
        matches!(self, Self::Once(_))
    }
}

/// Accepts standard 5-field expressions as well as the 6/7-field form with seconds.
fn parse_cron(expr: &str) -> Result<cron::Schedule, ScheduleError> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Delay before retrying after `previous_failures` consecutive failures:
/// `min(base * 2^previous_failures, cap)`.
#[must_use]
pub fn backoff_delay(previous_failures: i64, base: Duration, cap: Duration) -> Duration {
    let exponent = u32::try_from(previous_failures.clamp(0, 30)).unwrap_or(30);
    base.saturating_mul(2u32.saturating_pow(exponent)).min(cap)
}

/// [`backoff_delay`] with ±20% jitter, still capped.
#[must_use]
pub fn jittered_backoff(previous_failures: i64, base: Duration, cap: Duration) -> Duration {
    jittered(backoff_delay(previous_failures, base, cap), 0.2).min(cap)
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    fn config(json: &str) -> ScheduleConfig {
        ScheduleConfig::from_json(json).unwrap()
    }

    #[test]
    fn test_interval_first_and_next() {
        let schedule = Schedule::parse(ScheduleKind::Interval, &config(r#"{"interval_minutes":1}"#)).unwrap();
        assert_eq!(schedule.first_run(at(10, 0, 0)), Some(at(10, 1, 0)));
        // Keeps cadence from the scheduled slot even if the run started late
        assert_eq!(schedule.next_after(at(10, 1, 0), at(10, 1, 1)), Some(at(10, 2, 0)));
        // Never schedules into the past after a long outage
        assert_eq!(schedule.next_after(at(10, 1, 0), at(12, 0, 0)), Some(at(12, 0, 0)));
    }

    #[test]
    fn test_cron_next_is_strictly_after() {
        let schedule = Schedule::parse(ScheduleKind::Cron, &config(r#"{"cron":"0 3 * * *"}"#)).unwrap();
        assert_eq!(
            schedule.next_after(at(3, 0, 0), at(3, 0, 5)),
            Some(Utc.with_ymd_and_hms(2024, 5, 2, 3, 0, 0).unwrap())
        );
        assert_eq!(schedule.first_run(at(1, 0, 0)), Some(at(3, 0, 0)));
    }

    #[test]
    fn test_once_runs_then_finishes() {
        let schedule = Schedule::parse(ScheduleKind::Once, &ScheduleConfig::default()).unwrap();
        assert_eq!(schedule.first_run(at(9, 0, 0)), Some(at(9, 0, 0)));
        assert_eq!(schedule.next_after(at(9, 0, 0), at(9, 0, 1)), None);

        let later = Schedule::parse(
            ScheduleKind::Once,
            &config(r#"{"run_at":"2024-05-01T11:00:00.000Z"}"#),
        )
        .unwrap();
        assert_eq!(later.first_run(at(9, 0, 0)), Some(at(11, 0, 0)));
    }

    #[test]
    fn test_invalid_configs() {
        assert_eq!(
            Schedule::parse(ScheduleKind::Interval, &config(r#"{"interval_minutes":0}"#)).unwrap_err(),
            ScheduleError::MissingInterval
        );
        assert_eq!(
            Schedule::parse(ScheduleKind::Cron, &ScheduleConfig::default()).unwrap_err(),
            ScheduleError::MissingCron
        );
        assert!(matches!(
            Schedule::parse(ScheduleKind::Cron, &config(r#"{"cron":"not a cron"}"#)),
            Err(ScheduleError::InvalidCron { .. })
        ));
        assert!(ScheduleConfig::from_json("{broken").is_err());
        assert_eq!(ScheduleConfig::from_json("").unwrap(), ScheduleConfig::default());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(60);
        let cap = Duration::from_secs(3600);
        assert_eq!(backoff_delay(0, base, cap), Duration::from_secs(60));
        assert_eq!(backoff_delay(1, base, cap), Duration::from_secs(120));
        assert_eq!(backoff_delay(3, base, cap), Duration::from_secs(480));
        assert_eq!(backoff_delay(10, base, cap), cap);
        assert!(jittered_backoff(10, base, cap) <= cap);
    }
}
