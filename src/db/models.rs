use serde::{Deserialize, Serialize};

// ========== Scheduler ==========

/// Kind of work a scheduled job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ScrapeThread,
    VerifyLinks,
    CleanupActivities,
    CleanupAudit,
}

impl JobKind {
    pub const ALL: [Self; 4] = [
        Self::ScrapeThread,
        Self::VerifyLinks,
        Self::CleanupActivities,
        Self::CleanupAudit,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScrapeThread => "scrape_thread",
            Self::VerifyLinks => "verify_links",
            Self::CleanupActivities => "cleanup_activities",
            Self::CleanupAudit => "cleanup_audit",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "scrape_thread" => Some(Self::ScrapeThread),
            "verify_links" => Some(Self::VerifyLinks),
            "cleanup_activities" | "cleanup_old_activities" => Some(Self::CleanupActivities),
            "cleanup_audit" | "cleanup_old_audit_logs" => Some(Self::CleanupAudit),
            _ => None,
        }
    }
}

/// How a job's next run is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    Interval,
    Cron,
    Once,
}

impl ScheduleKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interval => "interval",
            Self::Cron => "cron",
            Self::Once => "once",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "interval" => Some(Self::Interval),
            "cron" => Some(Self::Cron),
            "once" => Some(Self::Once),
            _ => None,
        }
    }
}

/// Result of a job's most recent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Ok,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Ok => "ok",
            Self::Failed => "failed",
        }
    }
}

/// A persistent scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScheduledJob {
    pub id: i64,
    pub job_type: String,
    pub schedule_type: String,
    /// JSON-encoded [`crate::scheduler::ScheduleConfig`].
    pub schedule_config: String,
    pub target_type: Option<String>,
    pub target_id: Option<i64>,
    pub enabled: bool,
    pub last_run_at: Option<String>,
    pub next_run_at: Option<String>,
    pub last_status: Option<String>,
    pub last_error: Option<String>,
    pub consecutive_failures: i64,
    pub run_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    #[serde(skip_serializing)]
    pub claim_token: Option<String>,
    pub claim_expires_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ScheduledJob {
    #[must_use]
    pub fn kind(&self) -> Option<JobKind> {
        JobKind::from_str(&self.job_type)
    }

    #[must_use]
    pub fn schedule_kind(&self) -> Option<ScheduleKind> {
        ScheduleKind::from_str(&self.schedule_type)
    }
}

/// Data for inserting a scheduled job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub schedule_type: String,
    pub schedule_config: String,
    pub target_type: Option<String>,
    pub target_id: Option<i64>,
    pub enabled: bool,
    pub next_run_at: Option<String>,
}

/// Fields written when a claimed run finishes.
#[derive(Debug, Clone)]
pub struct JobRunOutcome {
    pub status: RunStatus,
    pub error: Option<String>,
    pub last_run_at: String,
    pub next_run_at: Option<String>,
    pub enabled: bool,
    pub consecutive_failures: i64,
}

/// One execution of a scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobExecution {
    pub id: i64,
    pub job_id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub error: Option<String>,
    /// Free-form JSON stats reported by the worker.
    pub stats: Option<String>,
    pub duration_ms: Option<i64>,
}

// ========== Activities ==========

/// Lifecycle state of an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Running,
    Completed,
    Failed,
}

impl ActivityStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A progress record for a long-running operation.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Activity {
    pub id: i64,
    pub task_type: String,
    pub label: String,
    pub status: String,
    pub is_paused: bool,
    pub progress_current: i64,
    pub progress_total: Option<i64>,
    pub started_at: String,
    pub updated_at: String,
    pub finished_at: Option<String>,
    pub error: Option<String>,
    pub details: Option<String>,
}

/// Filter for listing activities.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActivityFilter {
    pub status: Option<String>,
    pub task_type: Option<String>,
    pub limit: Option<i64>,
}

// ========== Forum archive ==========

/// A remote forum thread.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Thread {
    pub id: i64,
    pub url: String,
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub forum_category: Option<String>,
    /// JSON array of tag strings.
    pub tags: Option<String>,
    pub view_count: Option<i64>,
    pub reply_count: Option<i64>,
    pub first_seen_at: String,
    pub last_scraped_at: Option<String>,
    pub is_active: bool,
}

/// Thread row with aggregate counts for listings.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ThreadSummary {
    pub id: i64,
    pub url: String,
    pub title: Option<String>,
    pub forum_category: Option<String>,
    pub first_seen_at: String,
    pub last_scraped_at: Option<String>,
    pub is_active: bool,
    pub post_count: i64,
    pub link_count: i64,
    pub active_link_count: i64,
}

/// Listing parameters for threads.
#[derive(Debug, Clone, Default)]
pub struct ThreadQuery {
    pub page: i64,
    pub limit: i64,
    pub sort: ThreadSort,
    pub provider: Option<String>,
    pub filter: Option<ThreadFilter>,
    /// Substring of the title or of a post author.
    pub search: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadSort {
    #[default]
    DateDesc,
    DateAsc,
    TitleAsc,
    TitleDesc,
    RepliesDesc,
    DownloadsDesc,
}

impl ThreadSort {
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "date_desc" => Some(Self::DateDesc),
            "date_asc" => Some(Self::DateAsc),
            "title_asc" => Some(Self::TitleAsc),
            "title_desc" => Some(Self::TitleDesc),
            "replies_desc" => Some(Self::RepliesDesc),
            "downloads_desc" => Some(Self::DownloadsDesc),
            _ => None,
        }
    }

    pub(crate) fn order_clause(self) -> &'static str {
        match self {
            Self::DateDesc => "t.first_seen_at DESC, t.id DESC",
            Self::DateAsc => "t.first_seen_at ASC, t.id ASC",
            Self::TitleAsc => "t.title COLLATE NOCASE ASC, t.id ASC",
            Self::TitleDesc => "t.title COLLATE NOCASE DESC, t.id DESC",
            Self::RepliesDesc => "COALESCE(t.reply_count, 0) DESC, t.id DESC",
            Self::DownloadsDesc => "link_count DESC, t.id DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadFilter {
    HasDownloads,
    NoDownloads,
}

impl ThreadFilter {
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "has_downloads" => Some(Self::HasDownloads),
            "no_downloads" => Some(Self::NoDownloads),
            _ => None,
        }
    }
}

/// A post within a thread.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Post {
    pub id: i64,
    pub thread_id: i64,
    pub external_post_id: String,
    pub author: Option<String>,
    pub posted_at: Option<String>,
    pub body: String,
    pub content_hash: String,
    pub order_index: i64,
    pub first_seen_at: String,
    pub updated_at: String,
    pub removed_at: Option<String>,
}

/// Verification state of a download link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Unknown,
    Active,
    Dead,
    RateLimited,
}

impl LinkStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Active => "active",
            Self::Dead => "dead",
            Self::RateLimited => "rate_limited",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(Self::Unknown),
            "active" => Some(Self::Active),
            "dead" => Some(Self::Dead),
            "rate_limited" => Some(Self::RateLimited),
            _ => None,
        }
    }
}

/// Local download state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloaded,
    Failed,
}

impl DownloadStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloaded => "downloaded",
            Self::Failed => "failed",
        }
    }
}

/// A download link harvested from a thread.
///
/// Columns split into disjoint groups: identity (written by the scraper),
/// verification (written by the verifier), and download tracking.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DownloadLink {
    pub id: i64,
    pub thread_id: i64,
    pub post_id: Option<i64>,
    pub url: String,
    pub provider: String,
    pub filename: Option<String>,
    pub first_seen_at: String,

    pub status: String,
    pub status_version: i64,
    pub file_size: Option<i64>,
    pub file_type: Option<String>,
    pub last_checked_at: Option<String>,
    pub check_count: i64,
    pub consecutive_failures: i64,
    pub requires_auth: bool,
    pub rate_limited_until: Option<String>,
    pub last_http_status: Option<i64>,

    pub download_status: String,
    pub downloaded_at: Option<String>,
    pub download_path: Option<String>,
    pub notes: Option<String>,
}

impl DownloadLink {
    #[must_use]
    pub fn status_enum(&self) -> Option<LinkStatus> {
        LinkStatus::from_str(&self.status)
    }
}

/// Verifier-owned columns written after one probe.
#[derive(Debug, Clone)]
pub struct LinkCheckUpdate {
    pub status: LinkStatus,
    pub checked_at: String,
    pub consecutive_failures: i64,
    pub requires_auth: bool,
    pub rate_limited_until: Option<String>,
    pub http_status: Option<i64>,
    pub file_size: Option<i64>,
    pub file_type: Option<String>,
}

/// Per-status link counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkStatusCounts {
    pub total: i64,
    pub unknown: i64,
    pub active: i64,
    pub dead: i64,
    pub rate_limited: i64,
}

/// A performer that threads can be linked to.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Performer {
    pub id: i64,
    pub name: String,
}

/// A thread-performer association.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ThreadPerformer {
    pub performer_id: i64,
    pub name: String,
    pub confidence: f64,
}

/// Counts from linking every thread to the performers named in its title.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoLinkStats {
    pub threads_scanned: u64,
    pub performers_created: u64,
    pub links_made: u64,
}

// ========== Scrape snapshots ==========

/// A parsed post ready to be committed.
#[derive(Debug, Clone)]
pub struct SnapshotPost {
    pub external_post_id: String,
    pub author: Option<String>,
    pub posted_at: Option<String>,
    pub body: String,
    pub order_index: i64,
    pub links: Vec<SnapshotLink>,
}

/// A classified, normalized link found in a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotLink {
    pub url: String,
    pub provider: String,
    pub filename: Option<String>,
}

/// Everything a scrape learned about a thread.
#[derive(Debug, Clone, Default)]
pub struct ThreadSnapshot {
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub forum_category: Option<String>,
    pub tags: Vec<String>,
    pub view_count: Option<i64>,
    pub reply_count: Option<i64>,
    pub posts: Vec<SnapshotPost>,
    pub performer_names: Vec<String>,
}

/// Counts from committing a snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotStats {
    pub posts_inserted: u64,
    pub posts_updated: u64,
    pub posts_removed: u64,
    pub links_inserted: u64,
    pub links_seen: u64,
    pub performers_linked: u64,
}

// ========== Media library ==========

/// A registered library root on the local filesystem.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Library {
    pub id: i64,
    pub name: String,
    pub path: String,
    pub created_at: String,
}

/// A cataloged video file, addressed relative to its library root.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Video {
    pub id: i64,
    pub library_id: i64,
    pub relative_path: String,
    pub title: Option<String>,
    pub file_size: Option<i64>,
    pub created_at: String,
}

// ========== Stats ==========

/// Archive-wide totals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveStats {
    pub threads: i64,
    pub posts: i64,
    pub links: LinkStatusCounts,
    pub downloaded: i64,
    pub providers: Vec<ProviderCount>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProviderCount {
    pub provider: String,
    pub count: i64,
}
