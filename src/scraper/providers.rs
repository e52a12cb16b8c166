//! Known file-hosting providers.
//!
//! Each provider carries the pattern that recognises its share links plus the
//! signals the verifier uses to classify a probe response.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

/// A file-hosting provider whose links are worth archiving.
#[derive(Debug)]
pub struct Provider {
    pub name: &'static str,
    pub pattern: Regex,
    /// Substrings of a small response body that mean the file is gone.
    pub dead_signatures: &'static [&'static str],
    /// Substrings of a redirect target that mean the file is gone.
    pub dead_redirects: &'static [&'static str],
    /// Substrings of a response body that mean the host is throttling us.
    pub throttle_signatures: &'static [&'static str],
    /// How long to leave the host alone after it throttles.
    pub cooldown: Option<Duration>,
}

const GENERIC_DEAD: &[&str] = &[
    "file not found",
    "file has been removed",
    "file was deleted",
    "no longer available",
    "this file does not exist",
];

const GENERIC_THROTTLE: &[&str] = &["too many requests", "rate limit exceeded", "slow down"];

fn provider(
    name: &'static str,
    pattern: &str,
    dead_signatures: &'static [&'static str],
    dead_redirects: &'static [&'static str],
    cooldown: Option<Duration>,
) -> Provider {
    Provider {
        name,
        pattern: Regex::new(pattern).expect("Invalid provider pattern"),
        dead_signatures,
        dead_redirects,
        throttle_signatures: GENERIC_THROTTLE,
        cooldown,
    }
}

static PROVIDERS: LazyLock<Vec<Provider>> = LazyLock::new(|| {
    vec![
        provider(
            "gofile",
            r"https?://(?:www\.)?gofile\.io/d/[A-Za-z0-9_-]+",
            &["this content does not exist", "content not found", "\"status\":\"error-notfound\""],
            &["/404"],
            Some(Duration::from_secs(30 * 60)),
        ),
        provider(
            "pixeldrain",
            r"https?://(?:www\.)?pixeldrain\.com/(?:u|l)/[A-Za-z0-9_-]+",
            &["\"value\":\"not_found\"", "file_not_found", "this file has been deleted"],
            &[],
            None,
        ),
        provider(
            "bunkr",
            r"https?://(?:www\.)?(?:bunkr|bunkrr)\.[a-z]+/[a-z]/[A-Za-z0-9_-]+",
            &["file not found", "album not found", "this file has been removed"],
            &["/lost", "/404"],
            None,
        ),
        provider(
            "cyberdrop",
            r"https?://(?:www\.)?cyberdrop\.(?:me|to|cc)/a/[A-Za-z0-9_-]+",
            &["album not found", "this album does not exist"],
            &["/404"],
            None,
        ),
        provider(
            "mediafire",
            r"https?://(?:www\.)?mediafire\.com/(?:file|folder)/[A-Za-z0-9_/-]+",
            &["the key you provided for file download was invalid", "file removed for violation"],
            &["error.php", "/file_removed"],
            None,
        ),
        provider(
            "mega",
            r"https?://(?:www\.)?mega\.nz/(?:file|folder)/[A-Za-z0-9#_-]+",
            &["the file you are trying to download is no longer available"],
            &[],
            Some(Duration::from_secs(60 * 60)),
        ),
    ]
});

/// All known providers.
#[must_use]
pub fn all() -> &'static [Provider] {
    &PROVIDERS
}

/// Look a provider up by name.
#[must_use]
pub fn by_name(name: &str) -> Option<&'static Provider> {
    PROVIDERS.iter().find(|p| p.name == name)
}

/// Provider whose pattern matches `url`.
#[must_use]
pub fn classify(url: &str) -> Option<&'static Provider> {
    PROVIDERS.iter().find(|p| p.pattern.is_match(url))
}

/// Every provider link found in free text, with its provider.
#[must_use]
pub fn find_in_text(text: &str) -> Vec<(&'static Provider, String)> {
    let mut found = Vec::new();
    for provider in PROVIDERS.iter() {
        for m in provider.pattern.find_iter(text) {
            found.push((provider, m.as_str().to_string()));
        }
    }
    found
}

impl Provider {
    /// Whether a lowercased body looks like this provider's "file gone" page.
    #[must_use]
    pub fn body_says_dead(&self, body_lower: &str) -> bool {
        self.dead_signatures
            .iter()
            .chain(GENERIC_DEAD)
            .any(|sig| body_lower.contains(sig))
    }

    /// Whether a redirect target points at this provider's "file gone" page.
    #[must_use]
    pub fn redirect_says_dead(&self, location: &str) -> bool {
        let lower = location.to_lowercase();
        self.dead_redirects.iter().any(|marker| lower.contains(marker))
    }

    /// Whether a lowercased body says the host is throttling.
    #[must_use]
    pub fn body_says_throttled(&self, body_lower: &str) -> bool {
        self.throttle_signatures
            .iter()
            .any(|sig| body_lower.contains(sig))
    }
}
