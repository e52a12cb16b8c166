use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};

use super::normalize::normalize_link_url;
use super::providers;
use crate::db::SnapshotLink;

static LINK_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("Invalid selector"));

/// Extract provider download links from a post body.
///
/// Links come from anchors and from bare URLs in the text. Only links to a
/// known provider are kept, normalized and deduplicated in document order.
#[must_use]
pub fn extract_download_links(body_html: &str) -> Vec<SnapshotLink> {
    let fragment = Html::parse_fragment(body_html);
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for element in fragment.select(&LINK_SELECTOR) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        if href.is_empty()
            || href.starts_with('#')
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
        {
            continue;
        }
        let Some(provider) = providers::classify(href) else {
            continue;
        };
        let url = normalize_link_url(href);
        if seen.insert(url.clone()) {
            links.push(SnapshotLink {
                url,
                provider: provider.name.to_string(),
                filename: filename_hint(&element),
            });
        }
    }

    // Bare URLs pasted as text (often inside code blocks)
    let text: String = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    for (provider, raw) in providers::find_in_text(&text) {
        let url = normalize_link_url(&raw);
        if seen.insert(url.clone()) {
            links.push(SnapshotLink {
                url,
                provider: provider.name.to_string(),
                filename: None,
            });
        }
    }

    links
}

/// Anchor text when it looks like a file name rather than the URL itself.
fn filename_hint(element: &ElementRef) -> Option<String> {
    let text: String = element.text().collect();
    let text = text.trim();
    if text.is_empty() || text.len() > 255 || text.starts_with("http") {
        return None;
    }
    let (stem, ext) = text.rsplit_once('.')?;
    let ext_ok = !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric());
    (!stem.is_empty() && ext_ok).then(|| text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_anchor_links_for_known_providers() {
        let html = r#"
            <p>Mirror 1: <a href="https://gofile.io/d/AbC123">gofile</a></p>
            <p>Mirror 2: <a href="https://pixeldrain.com/u/xyz?utm_source=forum">clip_01.mp4</a></p>
            <p>Unrelated: <a href="https://example.com/page">site</a></p>
        "#;
        let links = extract_download_links(html);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].provider, "gofile");
        assert_eq!(links[1].url, "https://pixeldrain.com/u/xyz");
        assert_eq!(links[1].filename.as_deref(), Some("clip_01.mp4"));
        assert_eq!(links[0].filename, None);
    }

    #[test]
    fn test_extracts_bare_urls_from_text() {
        let html = "<div><code>https://cyberdrop.me/a/q1w2e3</code></div>";
        let links = extract_download_links(html);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].provider, "cyberdrop");
    }

    #[test]
    fn test_deduplicates_after_normalization() {
        let html = r#"
            <a href="http://www.gofile.io/d/abc">https://gofile.io/d/abc</a>
            <a href="https://gofile.io/d/abc/#x">again</a>
        "#;
        let links = extract_download_links(html);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].url, "https://gofile.io/d/abc");
    }

    #[test]
    fn test_skips_anchors_and_javascript() {
        let html = r##"<a href="#post-1">x</a><a href="javascript:void(0)">y</a>"##;
        assert!(extract_download_links(html).is_empty());
    }
}
