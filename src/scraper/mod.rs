//! Forum thread scraper: fetch, parse, extract links, commit one snapshot.

pub mod link_extractor;
pub mod normalize;
pub mod parser;
pub mod providers;

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::stream::{self, StreamExt};
use reqwest::header::COOKIE;
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::activity::{ActivityHandle, ActivityLedger};
use crate::config::ScraperConfig;
use crate::constants::{SESSION_COOKIE_KEY, TITLE_MATCH_CONFIDENCE};
use crate::db::{
    commit_thread_snapshot, get_performer_by_name, get_setting, get_thread, insert_performer,
    set_setting, suggest_thread_performer, thread_titles, upsert_thread_url, AutoLinkStats,
    Database, SnapshotPost, SnapshotStats, ThreadSnapshot,
};
use crate::hub::{Event, Hub, Topic};
use crate::net::{build_client, host_of, with_retry, FetchError, HostLimiter, RetryPolicy};

use link_extractor::extract_download_links;
use normalize::{clean_thread_url, external_thread_id, page_url};
use parser::{parse_listing_page, parse_thread_page, performer_candidates};

/// Result of one successful thread scrape.
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeReport {
    pub thread_id: i64,
    pub url: String,
    pub pages: u32,
    pub stats: SnapshotStats,
}

/// Result of a forum category scrape.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ForumReport {
    pub threads_found: usize,
    pub scraped: usize,
    pub failed: usize,
}

/// Accumulated state of a thread across its pages.
#[derive(Default)]
struct Collected {
    first: Option<parser::ThreadPage>,
    posts: Vec<parser::ParsedPost>,
    pages: u32,
}

#[derive(Clone)]
pub struct Scraper {
    db: Database,
    ledger: ActivityLedger,
    hub: Hub,
    limiter: Arc<HostLimiter>,
    client: reqwest::Client,
    config: Arc<ScraperConfig>,
    retry: RetryPolicy,
    session: Arc<RwLock<Option<String>>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl Scraper {
    /// Build the scraper and load any stored session cookie.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or the settings
    /// table cannot be read.
    pub async fn new(
        db: Database,
        ledger: ActivityLedger,
        hub: Hub,
        limiter: Arc<HostLimiter>,
        config: ScraperConfig,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let client = build_client(&config.user_agent, config.request_timeout(), 10)?;
        let session = get_setting(db.pool(), SESSION_COOKIE_KEY).await?;
        if session.is_some() {
            info!("Loaded stored forum session cookie");
        }
        let retry = RetryPolicy::new(
            config.retry_attempts.max(1),
            std::time::Duration::from_millis(config.retry_base_ms),
        );
        Ok(Self {
            db,
            ledger,
            hub,
            limiter,
            client,
            config: Arc::new(config),
            retry,
            session: Arc::new(RwLock::new(session)),
            tasks: TaskTracker::new(),
            shutdown,
        })
    }

    // ========== Session ==========

    /// Store the forum session cookie. Line breaks are removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the setting cannot be persisted.
    pub async fn set_session(&self, cookie: &str) -> Result<()> {
        let cleaned: String = cookie.chars().filter(|c| *c != '\n' && *c != '\r').collect();
        let cleaned = cleaned.trim().to_string();
        set_setting(self.db.pool(), SESSION_COOKIE_KEY, &cleaned).await?;
        *self.session.write().await = (!cleaned.is_empty()).then_some(cleaned);
        info!("Forum session cookie updated");
        Ok(())
    }

    pub async fn has_session(&self) -> bool {
        self.session.read().await.is_some()
    }

    // ========== Fetching ==========

    async fn fetch_page(&self, url: &str, cancel: &CancellationToken) -> Result<String, FetchError> {
        let host = host_of(url).unwrap_or_default();
        let host = host.as_str();
        let cookie = self.session.read().await.clone();
        let cookie = cookie.as_deref();

        with_retry(&self.retry, cancel, || async move {
            let _permit = tokio::select! {
                () = cancel.cancelled() => return Err(FetchError::Cancelled),
                permit = self.limiter.acquire(host) => permit,
            };
            let mut request = self.client.get(url);
            if let Some(cookie) = cookie {
                request = request.header(COOKIE, cookie);
            }
            let response = request.send().await.map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }
            response.text().await.map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })
        })
        .await
    }

    // ========== Threads ==========

    /// Scrape the thread stored under `thread_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread does not exist or the scrape fails.
    pub async fn scrape_thread_id(&self, thread_id: i64, cancel: &CancellationToken) -> Result<ScrapeReport> {
        let thread = get_thread(self.db.pool(), thread_id)
            .await?
            .with_context(|| format!("Thread {thread_id} not found"))?;
        self.scrape_thread(&thread.url, cancel).await
    }

    /// Fetch every page of a thread and commit it as one snapshot.
    ///
    /// The thread row is created if needed. On failure nothing from this
    /// invocation is committed and `last_scraped_at` is unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if a page fetch exhausts its retries, the scrape is
    /// cancelled, or the commit fails.
    pub async fn scrape_thread(&self, url: &str, cancel: &CancellationToken) -> Result<ScrapeReport> {
        let url = clean_thread_url(url);
        let (thread_id, _) = upsert_thread_url(self.db.pool(), &url).await?;
        let activity = self
            .ledger
            .open("scrape_thread", &format!("Scrape {url}"), None)
            .await?;

        self.hub.publish(Event::new(
            Topic::Scrape,
            "scrape:started",
            json!({ "thread_id": thread_id, "url": url, "activity_id": activity.id() }),
        ));
        info!(thread_id, url = %url, "Scrape started");

        let result = self.run_thread_scrape(thread_id, &url, &activity, cancel).await;
        self.limiter.prune_idle().await;
        match result {
            Ok(report) => {
                if let Err(e) = activity.complete().await {
                    error!(thread_id, "Failed to close scrape activity: {e:#}");
                }
                self.hub.publish(Event::new(
                    Topic::Scrape,
                    "scrape:completed",
                    json!({ "thread_id": thread_id, "pages": report.pages, "stats": report.stats }),
                ));
                info!(
                    thread_id,
                    pages = report.pages,
                    posts_inserted = report.stats.posts_inserted,
                    links_inserted = report.stats.links_inserted,
                    "Scrape completed"
                );
                Ok(report)
            }
            Err(e) => {
                let message = format!("{e:#}");
                if let Err(close_err) = activity.fail(&message).await {
                    error!(thread_id, "Failed to close scrape activity: {close_err:#}");
                }
                self.hub.publish(Event::new(
                    Topic::Scrape,
                    "scrape:failed",
                    json!({ "thread_id": thread_id, "error": message }),
                ));
                warn!(thread_id, "Scrape failed: {message}");
                Err(e)
            }
        }
    }

    async fn run_thread_scrape(
        &self,
        thread_id: i64,
        url: &str,
        activity: &ActivityHandle,
        cancel: &CancellationToken,
    ) -> Result<ScrapeReport> {
        let max_pages = self.config.max_pages_per_thread.max(1);
        let mut collected = Collected::default();

        for page in 1..=max_pages {
            if !activity.wait_while_paused(cancel).await? {
                return Err(FetchError::Cancelled.into());
            }

            let target = page_url(url, page);
            let html = self
                .fetch_page(&target, cancel)
                .await
                .with_context(|| format!("Failed to fetch page {page} of {url}"))?;
            let parsed = parse_thread_page(&html);
            debug!(thread_id, page, posts = parsed.posts.len(), "Parsed thread page");

            let has_next = parsed.has_next && page < max_pages;
            let total = if has_next {
                parsed.last_page.unwrap_or(page + 1).max(page + 1).min(max_pages)
            } else {
                page
            };

            collected.pages = page;
            collected.posts.extend(parsed.posts.iter().cloned());
            if collected.first.is_none() {
                collected.first = Some(parsed);
            }

            if let Err(e) = activity.step(i64::from(page), Some(i64::from(total)), None).await {
                warn!(thread_id, page, "Failed to record scrape progress: {e:#}");
            }
            self.hub.publish(Event::new(
                Topic::Scrape,
                "scrape:progress",
                json!({ "thread_id": thread_id, "current": page, "total": total }),
            ));

            if !has_next {
                break;
            }
        }

        let snapshot = build_snapshot(url, collected.first.unwrap_or_default(), collected.posts);
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled.into());
        }
        let stats = commit_thread_snapshot(self.db.pool(), thread_id, &snapshot).await?;

        Ok(ScrapeReport {
            thread_id,
            url: url.to_string(),
            pages: collected.pages,
            stats,
        })
    }

    // ========== Forums ==========

    /// Enumerate thread links on a forum listing and scrape each one with a
    /// bounded worker pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing cannot be fetched. Individual thread
    /// failures are counted, not propagated.
    pub async fn scrape_forum_category(
        &self,
        url: &str,
        max_threads: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<ForumReport> {
        let base = clean_thread_url(url);
        let activity = self
            .ledger
            .open("scrape_forum", &format!("Scrape forum {base}"), None)
            .await?;

        let result = self
            .run_forum_scrape(&base, max_threads, &activity, cancel)
            .await;
        let closed = match &result {
            Ok(report) => {
                info!(url = %base, found = report.threads_found, scraped = report.scraped, failed = report.failed, "Forum scrape finished");
                activity.complete().await
            }
            Err(e) => {
                warn!(url = %base, "Forum scrape failed: {e:#}");
                activity.fail(&format!("{e:#}")).await
            }
        };
        if let Err(e) = closed {
            error!(url = %base, "Failed to close forum scrape activity: {e:#}");
        }
        result
    }

    async fn run_forum_scrape(
        &self,
        base: &str,
        max_threads: Option<usize>,
        activity: &ActivityHandle,
        cancel: &CancellationToken,
    ) -> Result<ForumReport> {
        let limit = max_threads.unwrap_or(usize::MAX);
        let mut thread_urls: Vec<String> = Vec::new();

        for page in 1..=self.config.max_pages_per_thread.max(1) {
            let html = self
                .fetch_page(&page_url(base, page), cancel)
                .await
                .with_context(|| format!("Failed to fetch listing page {page} of {base}"))?;
            let listing = parse_listing_page(&html, base);
            for thread_url in listing.thread_urls {
                if thread_urls.len() < limit && !thread_urls.contains(&thread_url) {
                    thread_urls.push(thread_url);
                }
            }
            if !listing.has_next || thread_urls.len() >= limit {
                break;
            }
        }

        let total = thread_urls.len();
        let mut report = ForumReport {
            threads_found: total,
            ..ForumReport::default()
        };
        if let Err(e) = activity.step(0, Some(total as i64), None).await {
            warn!(url = %base, "Failed to record forum progress: {e:#}");
        }

        let mut results = stream::iter(thread_urls)
            .map(|thread_url| async move {
                let outcome = self.scrape_thread(&thread_url, cancel).await;
                (thread_url, outcome)
            })
            .buffer_unordered(self.config.concurrency.max(1));

        let mut done = 0i64;
        while let Some((thread_url, outcome)) = results.next().await {
            done += 1;
            match outcome {
                Ok(_) => report.scraped += 1,
                Err(e) => {
                    report.failed += 1;
                    debug!(url = %thread_url, "Thread scrape failed during forum scrape: {e:#}");
                }
            }
            if let Err(e) = activity.step(done, Some(total as i64), None).await {
                warn!(url = %base, "Failed to record forum progress: {e:#}");
            }
            if !activity.wait_while_paused(cancel).await? {
                return Err(FetchError::Cancelled.into());
            }
        }

        Ok(report)
    }

    // ========== Performers ==========

    /// Link every archived thread to the performers named in its title,
    /// registering names not seen before. Existing links keep the higher
    /// confidence.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn auto_link_performers(&self) -> Result<AutoLinkStats> {
        let pool = self.db.pool();
        let mut stats = AutoLinkStats::default();
        for (thread_id, title) in thread_titles(pool).await? {
            stats.threads_scanned += 1;
            let Some(title) = title else { continue };
            for name in performer_candidates(&title) {
                let performer_id = match get_performer_by_name(pool, &name).await? {
                    Some(performer) => performer.id,
                    None => {
                        stats.performers_created += 1;
                        insert_performer(pool, &name).await?
                    }
                };
                if suggest_thread_performer(pool, thread_id, performer_id, TITLE_MATCH_CONFIDENCE).await? {
                    stats.links_made += 1;
                    debug!(thread_id, performer = %name, "Linked thread to performer");
                }
            }
        }
        info!(
            threads = stats.threads_scanned,
            created = stats.performers_created,
            linked = stats.links_made,
            "Auto-linked threads to performers"
        );
        Ok(stats)
    }

    /// Run a forum scrape in the background, tracked for shutdown.
    pub fn spawn_forum_scrape(&self, url: String, max_threads: Option<usize>) {
        let scraper = self.clone();
        let cancel = self.shutdown.child_token();
        self.tasks.spawn(async move {
            if let Err(e) = scraper.scrape_forum_category(&url, max_threads, &cancel).await {
                warn!(url = %url, "Background forum scrape failed: {e:#}");
            }
        });
    }

    /// Wait for background scrapes to finish after shutdown has been signalled.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Turn collected pages into a snapshot ready to commit.
fn build_snapshot(url: &str, first: parser::ThreadPage, posts: Vec<parser::ParsedPost>) -> ThreadSnapshot {
    let performer_names = first
        .title
        .as_deref()
        .map(performer_candidates)
        .unwrap_or_default();

    let posts = posts
        .into_iter()
        .enumerate()
        .map(|(index, post)| SnapshotPost {
            links: extract_download_links(&post.body_html),
            external_post_id: post.external_post_id,
            author: post.author,
            posted_at: post.posted_at,
            body: post.body_text,
            order_index: index as i64,
        })
        .collect();

    ThreadSnapshot {
        external_id: external_thread_id(url),
        title: first.title,
        forum_category: first.forum_category,
        tags: first.tags,
        view_count: first.view_count,
        reply_count: first.reply_count,
        posts,
        performer_names,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(id: &str, html: &str) -> parser::ParsedPost {
        parser::ParsedPost {
            external_post_id: id.to_string(),
            author: Some("alice".to_string()),
            posted_at: None,
            body_text: html.to_string(),
            body_html: html.to_string(),
        }
    }

    #[test]
    fn test_build_snapshot_orders_posts_and_extracts_links() {
        let first = parser::ThreadPage {
            title: Some("Jane Doe - Beach".to_string()),
            tags: vec!["HD".to_string()],
            ..parser::ThreadPage::default()
        };
        let posts = vec![
            post("1", r#"<a href="https://gofile.io/d/abc">dl</a>"#),
            post("2", "no links"),
        ];
        let snapshot = build_snapshot("https://forum.example/threads/beach.77", first, posts);

        assert_eq!(snapshot.external_id.as_deref(), Some("77"));
        assert_eq!(snapshot.performer_names, vec!["Jane Doe"]);
        assert_eq!(snapshot.posts.len(), 2);
        assert_eq!(snapshot.posts[1].order_index, 1);
        assert_eq!(snapshot.posts[0].links.len(), 1);
        assert_eq!(snapshot.posts[0].links[0].provider, "gofile");
    }
}
