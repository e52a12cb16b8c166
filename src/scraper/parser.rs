//! HTML parsing for XenForo-style forum pages.

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use url::Url;

/// Bracketed title labels that are tags, not part of the title.
const COMMON_LABELS: &[&str] = &["NEW", "HD", "4K", "LEAKED", "EXCLUSIVE", "UPDATED", "MEGA", "PACK"];

/// Bracketed title terms that never name a performer.
const NON_PERFORMER_TERMS: &[&str] = &[
    "NEW", "HD", "4K", "UHD", "FHD", "1080P", "720P", "2160P", "LEAKED", "EXCLUSIVE", "UPDATED",
    "MEGA", "PACK", "VIDEO", "VIDEOS", "PHOTOS", "PICS", "SET", "SITERIP", "REQUEST", "COLLECTION",
];

struct Selectors {
    title: Selector,
    breadcrumb: Selector,
    tags: Selector,
    pair: Selector,
    dt: Selector,
    dd: Selector,
    post: Selector,
    author: Selector,
    body: Selector,
    time: Selector,
    next: Selector,
    page_number: Selector,
    current_page: Selector,
    listing_item: Selector,
}

static SELECTORS: LazyLock<Selectors> = LazyLock::new(|| {
    let parse = |s: &str| Selector::parse(s).expect("Invalid selector");
    Selectors {
        title: parse("h1.p-title-value"),
        breadcrumb: parse(".p-breadcrumbs li a"),
        tags: parse(".tagList a"),
        pair: parse("dl.pairs"),
        dt: parse("dt"),
        dd: parse("dd"),
        post: parse("article.message--post, .message--post"),
        author: parse(".message-name .username"),
        body: parse(".message-body .bbWrapper"),
        time: parse(".message-attribution-main time[datetime]"),
        next: parse(".pageNav-jump--next"),
        page_number: parse(".pageNav-page a, li.pageNav-page"),
        current_page: parse(".pageNav-page--current"),
        listing_item: parse(".structItem--thread .structItem-title a[data-tp-primary]"),
    }
});

/// One post as it appears on a page.
#[derive(Debug, Clone)]
pub struct ParsedPost {
    pub external_post_id: String,
    pub author: Option<String>,
    pub posted_at: Option<String>,
    /// Rendered text of the post body.
    pub body_text: String,
    /// Raw HTML of the post body, used for link extraction.
    pub body_html: String,
}

/// One page of a thread.
#[derive(Debug, Clone, Default)]
pub struct ThreadPage {
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub forum_category: Option<String>,
    pub view_count: Option<i64>,
    pub reply_count: Option<i64>,
    pub posts: Vec<ParsedPost>,
    /// Highest page number shown in the page navigation.
    pub last_page: Option<u32>,
    pub has_next: bool,
}

/// One page of a forum listing.
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub thread_urls: Vec<String>,
    pub has_next: bool,
}

/// Parse one page of a thread.
#[must_use]
pub fn parse_thread_page(html: &str) -> ThreadPage {
    let document = Html::parse_document(html);
    let sel = &*SELECTORS;

    let raw_title = document.select(&sel.title).next().map(|e| collapse_text(&e));
    let (title, mut tags) = raw_title
        .as_deref()
        .map(split_title)
        .unwrap_or_default();

    for tag in document.select(&sel.tags) {
        let tag = collapse_text(&tag);
        if !tag.is_empty() && !tags.iter().any(|t: &String| t.eq_ignore_ascii_case(&tag)) {
            tags.push(tag);
        }
    }

    // The last breadcrumb is the forum the thread lives in
    let forum_category = document
        .select(&sel.breadcrumb)
        .map(|e| collapse_text(&e))
        .filter(|t| !t.is_empty())
        .last();

    let (view_count, reply_count) = parse_counts(&document);

    let posts = document
        .select(&sel.post)
        .filter_map(|post| parse_post(&post))
        .collect();

    let (last_page, has_next) = parse_pagination(&document);

    ThreadPage {
        title: title.filter(|t| !t.is_empty()),
        tags,
        forum_category,
        view_count,
        reply_count,
        posts,
        last_page,
        has_next,
    }
}

fn parse_post(post: &ElementRef) -> Option<ParsedPost> {
    let sel = &*SELECTORS;
    let external_post_id = post
        .value()
        .attr("data-content")
        .or_else(|| post.value().attr("id"))
        .map(|id| id.trim_start_matches("js-").trim_start_matches("post-").to_string())
        .filter(|id| !id.is_empty())?;

    let author = post
        .select(&sel.author)
        .next()
        .map(|e| collapse_text(&e))
        .filter(|a| !a.is_empty());
    let posted_at = post
        .select(&sel.time)
        .next()
        .and_then(|t| t.value().attr("datetime"))
        .map(str::to_string);
    let body = post.select(&sel.body).next();
    let body_text = body.as_ref().map(collapse_text).unwrap_or_default();
    let body_html = body.map(|b| b.inner_html()).unwrap_or_default();

    Some(ParsedPost {
        external_post_id,
        author,
        posted_at,
        body_text,
        body_html,
    })
}

fn parse_counts(document: &Html) -> (Option<i64>, Option<i64>) {
    let sel = &*SELECTORS;
    let mut views = None;
    let mut replies = None;
    for pair in document.select(&sel.pair) {
        let Some(dt) = pair.select(&sel.dt).next() else {
            continue;
        };
        let Some(dd) = pair.select(&sel.dd).next() else {
            continue;
        };
        let label = collapse_text(&dt).to_lowercase();
        let value = parse_count(&collapse_text(&dd));
        if label.starts_with("views") {
            views = views.or(value);
        } else if label.starts_with("replies") {
            replies = replies.or(value);
        }
    }
    (views, replies)
}

fn parse_pagination(document: &Html) -> (Option<u32>, bool) {
    let sel = &*SELECTORS;
    let last_page = document
        .select(&sel.page_number)
        .filter_map(|e| collapse_text(&e).parse::<u32>().ok())
        .max();
    let current = document
        .select(&sel.current_page)
        .next()
        .and_then(|e| collapse_text(&e).parse::<u32>().ok())
        .unwrap_or(1);

    let next_enabled = document.select(&sel.next).any(|e| {
        !e.value()
            .attr("class")
            .is_some_and(|c| c.contains("is-disabled"))
    });
    let has_next = next_enabled || last_page.is_some_and(|last| last > current);
    (last_page, has_next)
}

/// Parse one page of a forum listing. Relative thread links resolve against `page_url`.
#[must_use]
pub fn parse_listing_page(html: &str, page_url: &str) -> ListingPage {
    let document = Html::parse_document(html);
    let sel = &*SELECTORS;
    let base = Url::parse(page_url).ok();

    let mut thread_urls: Vec<String> = Vec::new();
    for anchor in document.select(&sel.listing_item) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let resolved = match &base {
            Some(base) => base.join(href).map(|u| u.to_string()).ok(),
            None => Url::parse(href).ok().map(|u| u.to_string()),
        };
        if let Some(url) = resolved {
            let url = super::normalize::clean_thread_url(&url);
            if !thread_urls.contains(&url) {
                thread_urls.push(url);
            }
        }
    }

    let (_, has_next) = parse_pagination(&document);
    ListingPage {
        thread_urls,
        has_next,
    }
}

/// Split a raw title into the stored title and the label tags it carried.
#[must_use]
pub fn split_title(raw: &str) -> (Option<String>, Vec<String>) {
    let mut tags = Vec::new();
    let mut title = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(open) = rest.find('[') {
        let Some(close) = rest[open..].find(']').map(|c| open + c) else {
            break;
        };
        let inner = rest[open + 1..close].trim();
        title.push_str(&rest[..open]);
        if COMMON_LABELS.contains(&inner.to_uppercase().as_str()) {
            tags.push(inner.to_uppercase());
        } else {
            title.push_str(&rest[open..=close]);
        }
        rest = &rest[close + 1..];
    }
    title.push_str(rest);

    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    ((!title.is_empty()).then_some(title), tags)
}

/// Candidate performer names in a thread title.
///
/// Bracketed and parenthesised segments that are not quality or label terms,
/// plus the lead-in before a ` - ` separator. Comma, `&` and `/` split lists.
#[must_use]
pub fn performer_candidates(title: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut push = |candidate: &str| {
        for part in candidate.split([',', '&', '/']) {
            let name = part.split_whitespace().collect::<Vec<_>>().join(" ");
            if name.len() < 2 || name.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            if NON_PERFORMER_TERMS.contains(&name.to_uppercase().as_str()) {
                continue;
            }
            if !names.iter().any(|n| n.eq_ignore_ascii_case(&name)) {
                names.push(name);
            }
        }
    };

    for (open, close) in [('[', ']'), ('(', ')')] {
        let mut rest = title;
        while let Some(start) = rest.find(open) {
            let Some(len) = rest[start + 1..].find(close) else {
                break;
            };
            push(&rest[start + 1..start + 1 + len]);
            rest = &rest[start + 1 + len + 1..];
        }
    }

    if let Some((lead, _)) = title.split_once(" - ") {
        let lead = strip_groups(lead);
        push(&lead);
    }

    names
}

fn strip_groups(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    for c in text.chars() {
        match c {
            '[' | '(' => depth += 1,
            ']' | ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

/// Parse "1,234", "12K" or "1.5M" style counters.
#[allow(clippy::cast_possible_truncation)]
fn parse_count(text: &str) -> Option<i64> {
    let cleaned: String = text.chars().filter(|c| !c.is_whitespace() && *c != ',').collect();
    let (digits, multiplier) = match cleaned.chars().last()? {
        'K' | 'k' => (&cleaned[..cleaned.len() - 1], 1_000.0),
        'M' | 'm' => (&cleaned[..cleaned.len() - 1], 1_000_000.0),
        _ => (cleaned.as_str(), 1.0),
    };
    let value: f64 = digits.parse().ok()?;
    Some((value * multiplier).round() as i64)
}

fn collapse_text(element: &ElementRef) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
