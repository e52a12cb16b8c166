use url::Url;

/// Tracking parameters to strip from download URLs.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
    "gclid",
    "dclid",
    "ref",
    "ref_src",
    "referer",
    "referrer",
    "source",
    "share",
];

/// Hosts whose URL fragment carries data (mega keeps the decryption key there).
const FRAGMENT_HOSTS: &[&str] = &["mega.nz", "mega.io"];

/// Thread path suffixes that point at a view of the thread, not the thread.
const THREAD_VIEW_SUFFIXES: &[&str] = &["/unread", "/latest", "/reply"];

/// Normalize a download URL so the same file always maps to the same string.
///
/// Forces https, lowercases the host, drops `www.`, default ports, tracking
/// parameters, fragments (except where the fragment is significant), and
/// trailing slashes.
#[must_use]
pub fn normalize_link_url(url: &str) -> String {
    let Ok(parsed) = Url::parse(url.trim()) else {
        return url.trim().to_string();
    };

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return url.trim().to_string();
    }

    let mut normalized = parsed.clone();

    if normalized.scheme() == "http" {
        let _ = normalized.set_scheme("https");
    }

    if let Some(host) = normalized.host_str() {
        let lower_host = host.to_lowercase();
        let bare = lower_host.strip_prefix("www.").unwrap_or(&lower_host).to_string();
        if host != bare {
            let _ = normalized.set_host(Some(&bare));
        }
    }

    if normalized.port() == Some(443) || normalized.port() == Some(80) {
        let _ = normalized.set_port(None);
    }

    let filtered_params: Vec<(String, String)> = normalized
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    if filtered_params.is_empty() {
        normalized.set_query(None);
    } else {
        let new_query: String = filtered_params
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        normalized.set_query(Some(&new_query));
    }

    let keeps_fragment = normalized
        .host_str()
        .is_some_and(|h| FRAGMENT_HOSTS.contains(&h));
    if !keeps_fragment {
        normalized.set_fragment(None);
    }

    let path = normalized.path().to_string();
    if path.ends_with('/') && path.len() > 1 {
        normalized.set_path(path.trim_end_matches('/'));
    }

    normalized.to_string()
}

fn is_tracking_param(key: &str) -> bool {
    let lower = key.to_lowercase();
    TRACKING_PARAMS.contains(&lower.as_str()) || lower.starts_with("utm_")
}

/// Canonical form of a thread URL: no fragment, query, view suffix, page
/// suffix, or trailing slash. Scheme and port are kept.
#[must_use]
pub fn clean_thread_url(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url.trim()) else {
        return url.trim().trim_end_matches('/').to_string();
    };
    parsed.set_fragment(None);
    parsed.set_query(None);
    if let Some(host) = parsed.host_str() {
        let lower_host = host.to_lowercase();
        if host != lower_host {
            let _ = parsed.set_host(Some(&lower_host));
        }
    }

    let mut path = parsed.path().trim_end_matches('/').to_string();
    loop {
        let before = path.len();
        for suffix in THREAD_VIEW_SUFFIXES {
            if let Some(stripped) = path.strip_suffix(suffix) {
                path = stripped.to_string();
            }
        }
        if let Some(idx) = path.rfind("/page-") {
            if path[idx + 6..].chars().all(|c| c.is_ascii_digit()) && idx + 6 < path.len() {
                path.truncate(idx);
            }
        }
        path = path.trim_end_matches('/').to_string();
        if path.len() == before {
            break;
        }
    }
    if path.is_empty() {
        path.push('/');
    }
    parsed.set_path(&path);

    parsed.to_string().trim_end_matches('/').to_string()
}

/// URL of page `page` (1-based) of a cleaned thread or listing URL.
#[must_use]
pub fn page_url(base: &str, page: u32) -> String {
    if page <= 1 {
        base.to_string()
    } else {
        format!("{}/page-{page}", base.trim_end_matches('/'))
    }
}

/// External thread id: the suffix after the last `.` in the path
/// (`/threads/some-title.12345` -> `12345`).
#[must_use]
pub fn external_thread_id(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let path = parsed.path().trim_matches('/');
    let segment = path.rsplit('/').next()?;
    let (_, id) = segment.rsplit_once('.')?;
    (!id.is_empty()).then(|| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_force_https_and_strip_www() {
        assert_eq!(
            normalize_link_url("http://WWW.GoFile.io/d/AbC123"),
            "https://gofile.io/d/AbC123"
        );
    }

    #[test]
    fn test_remove_tracking_params() {
        assert_eq!(
            normalize_link_url("https://pixeldrain.com/u/xyz?utm_source=forum&download"),
            "https://pixeldrain.com/u/xyz?download"
        );
    }

    #[test]
    fn test_remove_fragment_and_trailing_slash() {
        assert_eq!(
            normalize_link_url("https://cyberdrop.me/a/album1/#top"),
            "https://cyberdrop.me/a/album1"
        );
    }

    #[test]
    fn test_mega_keeps_key_fragment() {
        assert_eq!(
            normalize_link_url("https://mega.nz/file/abcd#KEY-123"),
            "https://mega.nz/file/abcd#KEY-123"
        );
    }

    #[test]
    fn test_invalid_url_passthrough() {
        assert_eq!(normalize_link_url("  not a url "), "not a url");
    }

    #[test]
    fn test_clean_thread_url() {
        assert_eq!(
            clean_thread_url("https://Forum.example/threads/some-title.4242/unread"),
            "https://forum.example/threads/some-title.4242"
        );
        assert_eq!(
            clean_thread_url("https://forum.example/threads/some-title.4242/page-3#post-9"),
            "https://forum.example/threads/some-title.4242"
        );
        assert_eq!(
            clean_thread_url("http://127.0.0.1:8080/t/42/"),
            "http://127.0.0.1:8080/t/42"
        );
    }

    #[test]
    fn test_page_url() {
        assert_eq!(page_url("https://f.example/t/1", 1), "https://f.example/t/1");
        assert_eq!(page_url("https://f.example/t/1/", 3), "https://f.example/t/1/page-3");
    }

    #[test]
    fn test_external_thread_id() {
        assert_eq!(
            external_thread_id("https://forum.example/threads/some-title.4242").as_deref(),
            Some("4242")
        );
        assert_eq!(external_thread_id("https://forum.example/t/42"), None);
    }
}
