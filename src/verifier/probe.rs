//! Single-link probing and response classification.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE, RETRY_AFTER};
use reqwest::{Method, Response, StatusCode};

use crate::constants::SMALL_BODY_LIMIT;
use crate::db::{DownloadLink, LinkCheckUpdate, LinkStatus};
use crate::scraper::providers::Provider;

/// What one probe learned about a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Active {
        http_status: u16,
        file_size: Option<i64>,
        file_type: Option<String>,
        requires_auth: bool,
    },
    Dead {
        http_status: Option<u16>,
        reason: &'static str,
    },
    RateLimited {
        http_status: Option<u16>,
        retry_after: Option<Duration>,
    },
    /// Nothing conclusive: timeout, connection failure, or a server error.
    Inconclusive {
        http_status: Option<u16>,
        message: String,
    },
}

impl ProbeOutcome {
    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Active { http_status, .. } => Some(*http_status),
            Self::Dead { http_status, .. }
            | Self::RateLimited { http_status, .. }
            | Self::Inconclusive { http_status, .. } => *http_status,
        }
    }
}

/// Probe `url`: HEAD first, a one-byte ranged GET if HEAD is refused, and a
/// bounded body read when the response looks like a landing page.
pub async fn probe(client: &reqwest::Client, url: &str, provider: Option<&Provider>) -> ProbeOutcome {
    let (response, was_head) = match client.head(url).send().await {
        Ok(r) if matches!(r.status(), StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED) => {
            match ranged_get(client, url).await {
                Ok(r) => (r, false),
                Err(e) => return inconclusive(&e),
            }
        }
        Ok(r) => (r, true),
        Err(e) => return inconclusive(&e),
    };

    let status = response.status();
    let redirected_to = (response.url().as_str() != url).then(|| response.url().to_string());
    let headers = response.headers().clone();

    let body = if status.is_success() && wants_body(&headers) {
        let page = if was_head {
            match client.get(url).send().await {
                Ok(r) => read_small_body(r).await,
                Err(e) => return inconclusive(&e),
            }
        } else {
            read_small_body(response).await
        };
        Some(page)
    } else {
        None
    };

    classify(
        status.as_u16(),
        &headers,
        redirected_to.as_deref(),
        body.as_deref(),
        provider,
    )
}

async fn ranged_get(client: &reqwest::Client, url: &str) -> reqwest::Result<Response> {
    client
        .request(Method::GET, url)
        .header(RANGE, "bytes=0-0")
        .send()
        .await
}

fn inconclusive(error: &reqwest::Error) -> ProbeOutcome {
    let message = if error.is_timeout() {
        "timeout".to_string()
    } else if error.is_connect() {
        format!("connection failed: {error}")
    } else {
        error.to_string()
    };
    ProbeOutcome::Inconclusive {
        http_status: error.status().map(|s| s.as_u16()),
        message,
    }
}

/// Text-like responses small enough to be a provider's status page.
fn wants_body(headers: &HeaderMap) -> bool {
    let content_type = header_str(headers, CONTENT_TYPE).unwrap_or_default().to_lowercase();
    let texty = content_type.is_empty()
        || content_type.starts_with("text/")
        || content_type.contains("json")
        || content_type.contains("xml");
    let small = content_length(headers).map_or(true, |len| len <= SMALL_BODY_LIMIT);
    texty && small
}

async fn read_small_body(mut response: Response) -> String {
    let limit = usize::try_from(SMALL_BODY_LIMIT).unwrap_or(usize::MAX);
    let mut buf = Vec::new();
    while buf.len() < limit {
        match response.chunk().await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            _ => break,
        }
    }
    buf.truncate(limit);
    String::from_utf8_lossy(&buf).to_lowercase()
}

/// Classify a probe response. `body` is the lowercased page, when read.
#[must_use]
pub fn classify(
    status: u16,
    headers: &HeaderMap,
    redirected_to: Option<&str>,
    body: Option<&str>,
    provider: Option<&Provider>,
) -> ProbeOutcome {
    if let (Some(location), Some(provider)) = (redirected_to, provider) {
        if provider.redirect_says_dead(location) {
            return ProbeOutcome::Dead {
                http_status: Some(status),
                reason: "redirected to removal page",
            };
        }
    }

    match status {
        429 => ProbeOutcome::RateLimited {
            http_status: Some(status),
            retry_after: retry_after(headers),
        },
        404 | 410 => ProbeOutcome::Dead {
            http_status: Some(status),
            reason: "not found",
        },
        401 | 403 => ProbeOutcome::Active {
            http_status: status,
            file_size: None,
            file_type: None,
            requires_auth: true,
        },
        200..=299 => {
            if let (Some(body), Some(provider)) = (body, provider) {
                if provider.body_says_throttled(body) {
                    return ProbeOutcome::RateLimited {
                        http_status: Some(status),
                        retry_after: retry_after(headers),
                    };
                }
                if provider.body_says_dead(body) {
                    return ProbeOutcome::Dead {
                        http_status: Some(status),
                        reason: "removal notice in page",
                    };
                }
            }
            ProbeOutcome::Active {
                http_status: status,
                file_size: file_size(headers),
                file_type: header_str(headers, CONTENT_TYPE)
                    .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string())
                    .filter(|ct| !ct.is_empty()),
                requires_auth: false,
            }
        }
        _ => ProbeOutcome::Inconclusive {
            http_status: Some(status),
            message: format!("unexpected HTTP {status}"),
        },
    }
}

/// The store update for `outcome`, given the link's current state.
///
/// Rate limits never count toward `consecutive_failures`; inconclusive
/// probes do, and reaching `failure_threshold` marks the link dead.
#[must_use]
pub fn next_state(
    link: &DownloadLink,
    outcome: &ProbeOutcome,
    now: DateTime<Utc>,
    failure_threshold: i64,
    default_cooldown: Duration,
    provider: Option<&Provider>,
) -> LinkCheckUpdate {
    let checked_at = crate::db::format_timestamp(now);
    let http_status = outcome.http_status().map(i64::from);
    let current = link.status_enum().unwrap_or(LinkStatus::Unknown);

    match outcome {
        ProbeOutcome::Active {
            file_size,
            file_type,
            requires_auth,
            ..
        } => LinkCheckUpdate {
            status: LinkStatus::Active,
            checked_at,
            consecutive_failures: 0,
            requires_auth: *requires_auth,
            rate_limited_until: None,
            http_status,
            file_size: *file_size,
            file_type: file_type.clone(),
        },
        ProbeOutcome::Dead { .. } => LinkCheckUpdate {
            status: LinkStatus::Dead,
            checked_at,
            consecutive_failures: 0,
            requires_auth: false,
            rate_limited_until: None,
            http_status,
            file_size: None,
            file_type: None,
        },
        ProbeOutcome::RateLimited { retry_after, .. } => {
            let cooldown = retry_after
                .or_else(|| provider.and_then(|p| p.cooldown))
                .unwrap_or(default_cooldown);
            let until = now + chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::zero());
            LinkCheckUpdate {
                status: LinkStatus::RateLimited,
                checked_at,
                consecutive_failures: link.consecutive_failures,
                requires_auth: link.requires_auth,
                rate_limited_until: Some(crate::db::format_timestamp(until)),
                http_status,
                file_size: None,
                file_type: None,
            }
        }
        ProbeOutcome::Inconclusive { .. } => {
            let failures = link.consecutive_failures + 1;
            let status = if failures >= failure_threshold {
                LinkStatus::Dead
            } else {
                current
            };
            LinkCheckUpdate {
                status,
                checked_at,
                consecutive_failures: failures,
                requires_auth: link.requires_auth,
                rate_limited_until: link.rate_limited_until.clone(),
                http_status,
                file_size: None,
                file_type: None,
            }
        }
    }
}

/// Seconds or HTTP-date form of `Retry-After`.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = header_str(headers, RETRY_AFTER)?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    (at - Utc::now()).to_std().ok()
}

/// Total size from `Content-Range: bytes 0-0/N`, else `Content-Length`.
fn file_size(headers: &HeaderMap) -> Option<i64> {
    if let Some(range) = header_str(headers, CONTENT_RANGE) {
        if let Some(total) = range.rsplit('/').next().and_then(|t| t.trim().parse::<i64>().ok()) {
            return Some(total);
        }
    }
    content_length(headers).and_then(|len| i64::try_from(len).ok())
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, CONTENT_LENGTH).and_then(|v| v.trim().parse().ok())
}

fn header_str(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
