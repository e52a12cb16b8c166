//! Shared constants used across the application.

/// User agent string used for forum fetches and link probes.
///
/// File hosts routinely serve different (or no) responses to obvious bots, so
/// probes present as a desktop browser.
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Redirects followed by the link prober before giving up.
pub const MAX_PROBE_REDIRECTS: usize = 5;

/// Bodies at or below this size are inspected for "file not found" markers.
pub const SMALL_BODY_LIMIT: u64 = 64 * 1024;

/// Minimum interval between persisted progress writes for one activity.
pub const ACTIVITY_STEP_COALESCE_MS: u64 = 500;

/// Key in `app_settings` holding the forum session cookie.
pub const SESSION_COOKIE_KEY: &str = "scraper_session_cookie";

/// Confidence of a thread-performer link inferred from the thread title.
pub const TITLE_MATCH_CONFIDENCE: f64 = 0.8;
