//! Link verifier: concurrent liveness probes under per-host politeness.
//!
//! A global semaphore bounds in-flight probes; the shared [`HostLimiter`]
//! keeps one request per host in flight with a minimum spacing. A link takes
//! its host before a worker slot, and links on a host that is cooling down
//! are marked rate limited without a request. Status writes
//! are compare-and-swap on the link's `status_version`, so a slow probe never
//! overwrites a newer result.

mod health;
pub mod probe;

pub use health::{HealthBook, ProviderHealth};
pub use probe::{classify, next_state, ProbeOutcome};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activity::ActivityLedger;
use crate::config::VerifierConfig;
use crate::constants::MAX_PROBE_REDIRECTS;
use crate::db::{
    apply_link_check, format_timestamp, get_links_due_for_check, get_links_for_thread,
    get_thread, link_status_counts, parse_timestamp, Database, DownloadLink, LinkStatus,
    LinkStatusCounts,
};
use crate::hub::{Event, Hub, Topic};
use crate::net::{build_client, host_of, HostLimiter};
use crate::scraper::providers::{self, Provider};

/// Result of checking one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Applied(LinkStatus),
    /// Status unchanged after an inconclusive probe.
    Unchanged,
    /// Another writer updated the link first; this result was discarded.
    Superseded,
    Cancelled,
}

/// Outcome counts of one verification batch.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct VerifyReport {
    pub checked: u64,
    pub active: u64,
    pub dead: u64,
    pub rate_limited: u64,
    pub unchanged: u64,
    pub superseded: u64,
    pub skipped: u64,
}

impl VerifyReport {
    fn add(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Applied(status) => {
                self.checked += 1;
                match status {
                    LinkStatus::Active => self.active += 1,
                    LinkStatus::Dead => self.dead += 1,
                    LinkStatus::RateLimited => self.rate_limited += 1,
                    LinkStatus::Unknown => self.unchanged += 1,
                }
            }
            Verdict::Unchanged => {
                self.checked += 1;
                self.unchanged += 1;
            }
            Verdict::Superseded => self.superseded += 1,
            Verdict::Cancelled => self.skipped += 1,
        }
    }
}

/// Cumulative counters since startup.
#[derive(Debug, Clone, Serialize)]
pub struct VerifierStats {
    pub total_checked: u64,
    pub active: u64,
    pub dead: u64,
    pub rate_limited: u64,
    pub unchanged: u64,
    pub in_flight: u64,
    pub last_check_at: Option<String>,
}

#[derive(Default)]
struct Counters {
    total_checked: AtomicU64,
    active: AtomicU64,
    dead: AtomicU64,
    rate_limited: AtomicU64,
    unchanged: AtomicU64,
    in_flight: AtomicU64,
}

struct InFlight<'a>(&'a AtomicU64);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

struct Inner {
    db: Database,
    ledger: ActivityLedger,
    hub: Hub,
    limiter: Arc<HostLimiter>,
    client: reqwest::Client,
    config: VerifierConfig,
    workers: Semaphore,
    health: Mutex<HealthBook>,
    counters: Counters,
    last_check_at: Mutex<Option<String>>,
    shutdown: CancellationToken,
}

/// Cloneable handle to the verifier service.
#[derive(Clone)]
pub struct Verifier {
    inner: Arc<Inner>,
}

impl Verifier {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        db: Database,
        ledger: ActivityLedger,
        hub: Hub,
        limiter: Arc<HostLimiter>,
        config: VerifierConfig,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let client = build_client(&config.user_agent, config.request_timeout(), MAX_PROBE_REDIRECTS)?;
        Ok(Self {
            inner: Arc::new(Inner {
                db,
                ledger,
                hub,
                limiter,
                client,
                workers: Semaphore::new(config.worker_count.max(1)),
                health: Mutex::new(HealthBook::new(config.health_window)),
                counters: Counters::default(),
                last_check_at: Mutex::new(None),
                shutdown,
                config,
            }),
        })
    }

    // ========== Public operations ==========

    /// Verify every link of a thread. Links still cooling down from a rate
    /// limit are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread does not exist or the store fails.
    pub async fn verify_thread(&self, thread_id: i64, cancel: &CancellationToken) -> Result<VerifyReport> {
        get_thread(self.inner.db.pool(), thread_id)
            .await?
            .with_context(|| format!("Thread {thread_id} not found"))?;
        let now = Utc::now();
        let (links, cooling): (Vec<_>, Vec<_>) = get_links_for_thread(self.inner.db.pool(), thread_id)
            .await?
            .into_iter()
            .partition(|link| {
                link.rate_limited_until
                    .as_deref()
                    .and_then(parse_timestamp)
                    .map_or(true, |until| until <= now)
            });

        let mut report = self
            .verify_batch(links, &format!("Verify links of thread {thread_id}"), cancel)
            .await?;
        report.skipped += cooling.len() as u64;
        Ok(report)
    }

    /// Verify up to `max` links not checked within `cutoff_days`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn verify_stale(&self, cutoff_days: i64, max: i64, cancel: &CancellationToken) -> Result<VerifyReport> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::days(cutoff_days.max(0));
        let links = get_links_due_for_check(
            self.inner.db.pool(),
            &format_timestamp(cutoff),
            &format_timestamp(now),
            max.clamp(1, 10_000),
        )
        .await?;
        if links.is_empty() {
            debug!("No stale links to verify");
            return Ok(VerifyReport::default());
        }
        self.verify_batch(links, &format!("Verify stale links (>{cutoff_days}d)"), cancel)
            .await
    }

    /// Rolling health of one provider, or of all providers.
    #[must_use]
    pub fn provider_health(&self, provider: Option<&str>) -> Vec<ProviderHealth> {
        let book = self
            .inner
            .health
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match provider {
            Some(name) => book.get(name).into_iter().collect(),
            None => book.all(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> VerifierStats {
        let c = &self.inner.counters;
        VerifierStats {
            total_checked: c.total_checked.load(Ordering::Relaxed),
            active: c.active.load(Ordering::Relaxed),
            dead: c.dead.load(Ordering::Relaxed),
            rate_limited: c.rate_limited.load(Ordering::Relaxed),
            unchanged: c.unchanged.load(Ordering::Relaxed),
            in_flight: c.in_flight.load(Ordering::Relaxed),
            last_check_at: self
                .inner
                .last_check_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    /// Per-status link counts for one thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn thread_counts(&self, thread_id: i64) -> Result<LinkStatusCounts> {
        link_status_counts(self.inner.db.pool(), Some(thread_id)).await
    }

    // ========== Background work ==========

    /// Spawn the TTL poll loop. It stops when the shutdown token fires.
    #[must_use]
    pub fn start(&self) -> JoinHandle<()> {
        let verifier = self.clone();
        tokio::spawn(async move { verifier.poll_loop().await })
    }

    async fn poll_loop(&self) {
        let interval = Duration::from_secs(self.inner.config.poll_interval_secs.max(1));
        let shutdown = self.inner.shutdown.clone();
        info!(interval_secs = interval.as_secs(), "Link verifier poll loop started");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
            let cancel = shutdown.child_token();
            match self
                .verify_stale(
                    self.inner.config.default_ttl_days,
                    self.inner.config.poll_batch_size,
                    &cancel,
                )
                .await
            {
                Ok(report) if report.checked > 0 => {
                    info!(checked = report.checked, dead = report.dead, "Stale link sweep finished");
                }
                Ok(_) => {}
                Err(e) => warn!("Stale link sweep failed: {e:#}"),
            }
        }
        info!("Link verifier poll loop stopped");
    }

    // ========== Internals ==========

    async fn verify_batch(
        &self,
        links: Vec<DownloadLink>,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<VerifyReport> {
        let total = links.len();
        let activity = self
            .inner
            .ledger
            .open("verify_links", label, Some(total as i64))
            .await?;
        self.inner.hub.publish(Event::new(
            Topic::Verification,
            "verification:started",
            json!({ "activity_id": activity.id(), "total": total }),
        ));

        let mut report = VerifyReport::default();
        // The worker semaphore bounds requests; every link gets a future so
        // links on idle hosts are not queued behind a throttled one
        let mut results = stream::iter(links)
            .map(|link| async move { self.check_link(&link, cancel).await })
            .buffer_unordered(total.max(1));

        let mut done = 0i64;
        let mut failure = None;
        while let Some(result) = results.next().await {
            done += 1;
            match result {
                Ok(verdict) => report.add(verdict),
                Err(e) => {
                    warn!("Link check failed: {e:#}");
                    failure.get_or_insert(e);
                }
            }
            if let Err(e) = activity.step(done, Some(total as i64), None).await {
                warn!(activity_id = activity.id(), "Failed to record verification progress: {e:#}");
            }
        }
        drop(results);
        let pruned = self.inner.limiter.prune_idle().await;
        if pruned > 0 {
            debug!(pruned, "Dropped idle hosts from the limiter");
        }

        self.inner.hub.publish(Event::new(
            Topic::Verification,
            "verification:completed",
            json!({ "activity_id": activity.id(), "report": report }),
        ));
        self.inner.hub.publish(Event::new(
            Topic::Verification,
            "verification:health",
            json!({ "providers": self.provider_health(None) }),
        ));

        let closed = match (&failure, cancel.is_cancelled()) {
            (Some(e), _) => activity.fail(&format!("{e:#}")).await,
            (None, true) => activity.fail("cancelled").await,
            (None, false) => activity.complete().await,
        };
        if let Err(e) = closed {
            warn!(activity_id = activity.id(), "Failed to close verification activity: {e:#}");
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Check one link and write the result.
    async fn check_link(&self, link: &DownloadLink, cancel: &CancellationToken) -> Result<Verdict> {
        let inner = &*self.inner;
        let provider = providers::by_name(&link.provider);
        let host = host_of(&link.url).unwrap_or_default();
        let default_cooldown = Duration::from_secs(inner.config.rate_limit_cooldown_secs);

        // Take the host before a worker slot so links queued on a throttled
        // host never hold workers other hosts could use
        let locked = tokio::select! {
            () = cancel.cancelled() => return Ok(Verdict::Cancelled),
            locked = inner.limiter.try_lock_host(&host) => locked,
        };
        let mut permit = match locked {
            Ok(permit) => permit,
            Err(remaining) => {
                debug!(link_id = link.id, %host, remaining_secs = remaining.as_secs(), "Host cooling down, link not contacted");
                let outcome = ProbeOutcome::RateLimited {
                    http_status: None,
                    retry_after: Some(remaining),
                };
                return self.settle(link, provider, &outcome, false).await;
            }
        };

        let _slot = tokio::select! {
            () = cancel.cancelled() => return Ok(Verdict::Cancelled),
            slot = inner.workers.acquire() => match slot {
                Ok(slot) => slot,
                Err(_) => return Ok(Verdict::Cancelled),
            },
        };
        let _in_flight = InFlight::enter(&inner.counters.in_flight);

        tokio::select! {
            () = cancel.cancelled() => return Ok(Verdict::Cancelled),
            () = permit.wait_turn(inner.config.per_host_spacing()) => {}
        }
        let outcome = tokio::select! {
            () = cancel.cancelled() => return Ok(Verdict::Cancelled),
            outcome = probe::probe(&inner.client, &link.url, provider) => outcome,
        };

        if let ProbeOutcome::RateLimited { retry_after, .. } = &outcome {
            let cooldown = retry_after
                .or_else(|| provider.and_then(|p| p.cooldown))
                .unwrap_or(default_cooldown);
            permit.cool_down(cooldown);
        }
        drop(permit);

        self.settle(link, provider, &outcome, true).await
    }

    /// Write the next state for `outcome`. `contacted` is false when the
    /// host was skipped, and such results stay out of provider health.
    async fn settle(
        &self,
        link: &DownloadLink,
        provider: Option<&'static Provider>,
        outcome: &ProbeOutcome,
        contacted: bool,
    ) -> Result<Verdict> {
        let inner = &*self.inner;
        let update = next_state(
            link,
            outcome,
            Utc::now(),
            inner.config.failure_threshold,
            Duration::from_secs(inner.config.rate_limit_cooldown_secs),
            provider,
        );

        let applied = apply_link_check(inner.db.pool(), link.id, link.status_version, &update).await?;
        if !applied {
            debug!(link_id = link.id, "Link changed during check, result discarded");
            return Ok(Verdict::Superseded);
        }

        let verdict = match outcome {
            ProbeOutcome::Inconclusive { message, .. } if update.status != LinkStatus::Dead => {
                debug!(link_id = link.id, provider = %link.provider, failures = update.consecutive_failures, "Check inconclusive: {message}");
                Verdict::Unchanged
            }
            _ => Verdict::Applied(update.status),
        };
        self.record(&link.provider, outcome, verdict, &update.checked_at, contacted);
        debug!(link_id = link.id, provider = %link.provider, status = update.status.as_str(), "Link checked");
        Ok(verdict)
    }

    fn record(&self, provider: &str, outcome: &ProbeOutcome, verdict: Verdict, checked_at: &str, contacted: bool) {
        let inner = &*self.inner;
        let c = &inner.counters;
        c.total_checked.fetch_add(1, Ordering::Relaxed);
        let sample = match verdict {
            Verdict::Applied(LinkStatus::Active) => {
                c.active.fetch_add(1, Ordering::Relaxed);
                LinkStatus::Active
            }
            Verdict::Applied(LinkStatus::Dead) => {
                c.dead.fetch_add(1, Ordering::Relaxed);
                // Threshold deaths are not evidence about the provider
                if matches!(outcome, ProbeOutcome::Inconclusive { .. }) {
                    LinkStatus::Unknown
                } else {
                    LinkStatus::Dead
                }
            }
            Verdict::Applied(LinkStatus::RateLimited) => {
                c.rate_limited.fetch_add(1, Ordering::Relaxed);
                LinkStatus::RateLimited
            }
            _ => {
                c.unchanged.fetch_add(1, Ordering::Relaxed);
                LinkStatus::Unknown
            }
        };
        if contacted {
            inner
                .health
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(provider, sample);
        }
        *inner
            .last_check_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(checked_at.to_string());
    }
}
