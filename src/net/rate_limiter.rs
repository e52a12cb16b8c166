//! Per-host politeness gate shared by the scraper and the link verifier.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::Instant;

#[derive(Debug, Default)]
struct HostSlot {
    /// Earliest instant the next request may start.
    next_allowed: Option<Instant>,
    /// Set when the host signalled throttling.
    cooling_until: Option<Instant>,
}

impl HostSlot {
    fn is_idle(&self, now: Instant) -> bool {
        self.next_allowed.map_or(true, |at| at <= now) && self.cooling_until.map_or(true, |at| at <= now)
    }
}

/// Per-host rate limiter.
///
/// At most one request is in flight per host, and consecutive requests to the
/// same host start at least `spacing` apart (a token bucket of capacity 1).
/// Hosts can carry their own spacing, and a host can be put on cooldown after
/// it signals throttling.
#[derive(Debug)]
pub struct HostLimiter {
    default_spacing: Duration,
    overrides: HashMap<String, Duration>,
    slots: RwLock<HashMap<String, Arc<Mutex<HostSlot>>>>,
}

impl HostLimiter {
    #[must_use]
    pub fn new(default_spacing: Duration) -> Self {
        Self {
            default_spacing,
            overrides: HashMap::new(),
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Use `spacing` for `host` instead of the default.
    #[must_use]
    pub fn with_override(mut self, host: &str, spacing: Duration) -> Self {
        self.overrides.insert(host.to_lowercase(), spacing);
        self
    }

    #[must_use]
    pub fn spacing_for(&self, host: &str) -> Duration {
        self.overrides
            .get(host)
            .copied()
            .unwrap_or(self.default_spacing)
    }

    /// Wait for this host's turn, sitting out any cooldown. The returned
    /// permit holds the host until dropped.
    pub async fn acquire(&self, host: &str) -> HostPermit {
        self.acquire_spaced(host, Duration::ZERO).await
    }

    /// Like [`acquire`](Self::acquire), but the next request to this host waits
    /// at least `min_spacing` even if the host's own spacing is shorter.
    pub async fn acquire_spaced(&self, host: &str, min_spacing: Duration) -> HostPermit {
        let mut permit = self.lock_host(host).await;
        let cooling_until = permit.guard.cooling_until;
        if let Some(until) = cooling_until {
            tokio::time::sleep_until(until).await;
        }
        permit.wait_turn(min_spacing).await;
        permit
    }

    /// Take the host without waiting out a cooldown.
    ///
    /// Still waits for an in-flight request on the same host, since that
    /// request may be the one that starts a cooldown. Spacing is not applied
    /// yet: call [`HostPermit::wait_turn`] right before sending.
    ///
    /// # Errors
    ///
    /// Returns the remaining cooldown if the host is cooling down.
    pub async fn try_lock_host(&self, host: &str) -> Result<HostPermit, Duration> {
        let permit = self.lock_host(host).await;
        let now = Instant::now();
        let cooling_until = permit.guard.cooling_until;
        match cooling_until {
            Some(until) if until > now => Err(until - now),
            _ => Ok(permit),
        }
    }

    async fn lock_host(&self, host: &str) -> HostPermit {
        let host = host.to_lowercase();
        let slot = self.get_or_create_slot(&host).await;
        let guard = slot.lock_owned().await;
        HostPermit {
            spacing: self.spacing_for(&host),
            host,
            guard,
        }
    }

    async fn get_or_create_slot(&self, host: &str) -> Arc<Mutex<HostSlot>> {
        // Fast path: check if slot exists
        {
            let read_guard = self.slots.read().await;
            if let Some(slot) = read_guard.get(host) {
                return Arc::clone(slot);
            }
        }

        let mut write_guard = self.slots.write().await;
        // Double-check: another task may have created it meanwhile
        if let Some(slot) = write_guard.get(host) {
            return Arc::clone(slot);
        }

        let slot = Arc::new(Mutex::new(HostSlot::default()));
        write_guard.insert(host.to_string(), Arc::clone(&slot));
        slot
    }

    /// Forget hosts nobody is using whose spacing and cooldown have elapsed.
    /// Returns how many were dropped.
    pub async fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.write().await;
        let before = slots.len();
        // A permit or a pending acquire holds its own clone of the slot
        slots.retain(|_, slot| {
            Arc::strong_count(slot) > 1 || slot.try_lock().map_or(true, |s| !s.is_idle(now))
        });
        before - slots.len()
    }

    /// Number of hosts currently tracked.
    pub async fn host_count(&self) -> usize {
        self.slots.read().await.len()
    }
}

/// Exclusive right to send one request to a host.
#[derive(Debug)]
pub struct HostPermit {
    host: String,
    spacing: Duration,
    guard: OwnedMutexGuard<HostSlot>,
}

impl HostPermit {
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Sleep until this host may be contacted again, then start the spacing
    /// window for the request about to be sent.
    pub async fn wait_turn(&mut self, min_spacing: Duration) {
        if let Some(at) = self.guard.next_allowed {
            tokio::time::sleep_until(at).await;
        }
        self.guard.next_allowed = Some(Instant::now() + self.spacing.max(min_spacing));
    }

    /// Hold off new requests to this host for at least `duration`. Takes
    /// effect before the host is released.
    pub fn cool_down(&mut self, duration: Duration) {
        let until = Instant::now() + duration;
        if self.guard.cooling_until.map_or(true, |at| at < until) {
            self.guard.cooling_until = Some(until);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_spacing_between_requests() {
        let limiter = HostLimiter::new(Duration::from_millis(500));
        let start = Instant::now();

        drop(limiter.acquire("example.com").await);
        drop(limiter.acquire("example.com").await);
        drop(limiter.acquire("example.com").await);

        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hosts_are_independent() {
        let limiter = HostLimiter::new(Duration::from_secs(10));
        let start = Instant::now();

        let _a = limiter.acquire("a.example").await;
        let _b = limiter.acquire("b.example").await;
        let _c = limiter.acquire("C.EXAMPLE").await;

        assert!(start.elapsed() < Duration::from_millis(1));
        assert_eq!(limiter.host_count().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_in_flight_per_host() {
        let limiter = Arc::new(HostLimiter::new(Duration::ZERO));
        let permit = limiter.acquire("example.com").await;

        let contender = Arc::clone(&limiter);
        let waiter = tokio::spawn(async move {
            let _p = contender.acquire("example.com").await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_override_and_cooldown() {
        let limiter = HostLimiter::new(Duration::from_millis(100))
            .with_override("slow.example", Duration::from_secs(2));
        assert_eq!(limiter.spacing_for("slow.example"), Duration::from_secs(2));
        assert_eq!(limiter.spacing_for("fast.example"), Duration::from_millis(100));

        limiter.acquire("fast.example").await.cool_down(Duration::from_secs(30));
        let start = Instant::now();
        drop(limiter.acquire("fast.example").await);
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_spaced_uses_longer_spacing() {
        let limiter = HostLimiter::new(Duration::from_millis(100));
        let start = Instant::now();
        drop(limiter.acquire_spaced("files.example", Duration::from_secs(1)).await);
        drop(limiter.acquire("files.example").await);
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooling_host_is_reported_not_awaited() {
        let limiter = Arc::new(HostLimiter::new(Duration::ZERO));
        let mut permit = limiter.try_lock_host("files.example").await.unwrap();

        // Queued behind the request that hits the throttle
        let contender = Arc::clone(&limiter);
        let waiter = tokio::spawn(async move { contender.try_lock_host("files.example").await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        permit.cool_down(Duration::from_secs(3));
        drop(permit);
        let start = Instant::now();
        let remaining = waiter.await.unwrap().unwrap_err();
        assert!(remaining > Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_millis(1));

        // Other hosts are unaffected
        assert!(limiter.try_lock_host("other.example").await.is_ok());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(limiter.try_lock_host("files.example").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_idle_keeps_busy_hosts() {
        let limiter = HostLimiter::new(Duration::from_secs(1));
        for i in 0..50 {
            drop(limiter.acquire(&format!("h{i}.example")).await);
        }
        let held = limiter.acquire("held.example").await;
        limiter.acquire("cool.example").await.cool_down(Duration::from_secs(60));
        assert_eq!(limiter.host_count().await, 52);

        // Spacing windows still open
        assert_eq!(limiter.prune_idle().await, 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(limiter.prune_idle().await, 50);
        assert_eq!(limiter.host_count().await, 2);
        assert_eq!(held.host(), "held.example");

        drop(held);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.prune_idle().await, 2);
        assert_eq!(limiter.host_count().await, 0);
    }
}
