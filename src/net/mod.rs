//! Outbound HTTP plumbing shared by the scraper and the verifier.

mod rate_limiter;

pub use rate_limiter::{HostLimiter, HostPermit};

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;

/// Failure of a single outbound fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether retrying the same request might succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => matches!(status, 408 | 429 | 500..=599),
            Self::Transport { .. } => true,
            Self::Cancelled => false,
        }
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Exponential backoff with proportional jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub factor: u32,
    /// Fraction of the delay randomly added or removed (0.2 = ±20%).
    pub jitter: f64,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(attempts: u32, base: Duration) -> Self {
        Self {
            attempts,
            base,
            factor: 2,
            jitter: 0.2,
        }
    }

    /// Delay before retry number `retry` (0-based), without jitter.
    #[must_use]
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        self.base
            .saturating_mul(self.factor.saturating_pow(retry))
    }

    /// Delay before retry number `retry` (0-based), jittered.
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        jittered(self.nominal_delay(retry), self.jitter)
    }
}

/// Scale `delay` by a random factor in `[1 - jitter, 1 + jitter]`.
#[must_use]
pub fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
    delay.mul_f64(factor.max(0.0))
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// # Errors
///
/// Returns the last error, or [`FetchError::Cancelled`] if `cancel` fires
/// while waiting.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut retry = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && retry + 1 < policy.attempts => {
                let delay = policy.delay(retry);
                warn!(attempt = retry + 1, delay_ms = delay.as_millis() as u64, "Fetch failed, retrying: {e}");
                retry += 1;
                tokio::select! {
                    () = cancel.cancelled() => return Err(FetchError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Build an HTTP client with the given user agent and hard timeout.
///
/// # Errors
///
/// Returns an error if the TLS backend fails to initialise.
pub fn build_client(user_agent: &str, timeout: Duration, max_redirects: usize) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .connect_timeout(timeout)
        .redirect(reqwest::redirect::Policy::limited(max_redirects))
        .gzip(true)
        .build()
        .context("Failed to build HTTP client")
}

/// Lowercased host of a URL, if it has one.
#[must_use]
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
}
