//! Download tracking and dispatch to a local download manager.
//!
//! The manager speaks the JDownloader direct-connection API:
//! `GET /flash/get/version` for availability and
//! `POST /linkgrabberv2/addLinks` to queue links.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::DownloadsConfig;
use crate::db::{
    get_link, insert_audit_log, mark_link_download_failed, mark_link_downloaded,
    reset_link_download, Database, DownloadStatus, LinkStatus,
};

const MANAGER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download manager is not reachable at {0}")]
    Unavailable(String),
    #[error("download manager rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("no dispatchable links")]
    NothingToDispatch,
}

/// Thin client for the download manager's HTTP API.
#[derive(Clone)]
pub struct DownloadManager {
    client: reqwest::Client,
    base_url: String,
    destination_folder: Option<String>,
    autostart: bool,
}

impl DownloadManager {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &DownloadsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(MANAGER_TIMEOUT)
            .build()
            .context("Failed to build download manager client")?;
        Ok(Self {
            client,
            base_url: config.manager_url.trim_end_matches('/').to_string(),
            destination_folder: config.destination_folder.clone(),
            autostart: config.autostart,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Manager version string, or `None` when it is not running.
    pub async fn version(&self) -> Option<String> {
        let response = self
            .client
            .get(format!("{}/flash/get/version", self.base_url))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body = response.text().await.ok()?;
        Some(body.trim().trim_matches('"').to_string())
    }

    /// Queue `urls` in the manager's link grabber.
    ///
    /// # Errors
    ///
    /// [`DownloadError::Unavailable`] on transport failure,
    /// [`DownloadError::Rejected`] on a non-2xx reply.
    pub async fn add_links(&self, urls: &[String], package_name: Option<&str>) -> Result<(), DownloadError> {
        if urls.is_empty() {
            return Err(DownloadError::NothingToDispatch);
        }
        let mut payload = json!({
            "links": urls,
            "autostart": self.autostart,
            "autoExtract": false,
        });
        if let Some(name) = package_name.filter(|n| !n.trim().is_empty()) {
            payload["packageName"] = json!(name.trim());
        }
        if let Some(folder) = &self.destination_folder {
            payload["destinationFolder"] = json!(folder);
        }

        let response = self
            .client
            .post(format!("{}/linkgrabberv2/addLinks", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                warn!("Download manager request failed: {e}");
                DownloadError::Unavailable(self.base_url.clone())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DownloadError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedLink {
    pub id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub dispatched: Vec<i64>,
    pub skipped: Vec<SkippedLink>,
}

/// Result of a download-state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Updated,
    /// The link is already downloaded; only an explicit reset changes it.
    AlreadyDownloaded,
    NotFound,
}

/// Download bookkeeping for links, plus dispatch to the manager.
#[derive(Clone)]
pub struct Downloads {
    db: Database,
    manager: DownloadManager,
}

impl Downloads {
    #[must_use]
    pub fn new(db: Database, manager: DownloadManager) -> Self {
        Self { db, manager }
    }

    #[must_use]
    pub fn manager(&self) -> &DownloadManager {
        &self.manager
    }

    /// Send active, not yet downloaded links to the manager.
    ///
    /// # Errors
    ///
    /// Returns a [`DownloadError`] (inside the `anyhow` chain) if nothing is
    /// dispatchable or the manager refuses the batch.
    pub async fn dispatch(&self, link_ids: &[i64], package_name: Option<&str>) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();
        let mut urls = Vec::new();

        for &id in link_ids {
            let skip = |reason: &str| SkippedLink {
                id,
                reason: reason.to_string(),
            };
            let Some(link) = get_link(self.db.pool(), id).await? else {
                report.skipped.push(skip("not found"));
                continue;
            };
            if link.download_status == DownloadStatus::Downloaded.as_str() {
                report.skipped.push(skip("already downloaded"));
                continue;
            }
            if link.status_enum() != Some(LinkStatus::Active) {
                report.skipped.push(skip(&format!("link is {}", link.status)));
                continue;
            }
            urls.push(link.url);
            report.dispatched.push(id);
        }

        if urls.is_empty() {
            return Err(DownloadError::NothingToDispatch.into());
        }
        self.manager.add_links(&urls, package_name).await?;

        let details = json!({ "link_ids": report.dispatched, "package_name": package_name }).to_string();
        if let Err(e) = insert_audit_log(self.db.pool(), "downloads.dispatch", Some(&details)).await {
            warn!("Failed to audit dispatch: {e:#}");
        }
        info!(
            dispatched = report.dispatched.len(),
            skipped = report.skipped.len(),
            "Dispatched links to download manager"
        );
        Ok(report)
    }

    /// # Errors
    ///
    /// Returns an error if the store update fails.
    pub async fn mark_downloaded(&self, id: i64, path: Option<&str>, notes: Option<&str>) -> Result<MarkOutcome> {
        if mark_link_downloaded(self.db.pool(), id, path, notes).await? {
            info!(link_id = id, "Link marked downloaded");
            return Ok(MarkOutcome::Updated);
        }
        self.explain_refusal(id).await
    }

    /// # Errors
    ///
    /// Returns an error if the store update fails.
    pub async fn mark_failed(&self, id: i64, notes: Option<&str>) -> Result<MarkOutcome> {
        if mark_link_download_failed(self.db.pool(), id, notes).await? {
            info!(link_id = id, "Link download marked failed");
            return Ok(MarkOutcome::Updated);
        }
        self.explain_refusal(id).await
    }

    /// Explicit reset back to `pending`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store update fails.
    pub async fn reset(&self, id: i64) -> Result<MarkOutcome> {
        if reset_link_download(self.db.pool(), id).await? {
            info!(link_id = id, "Link download reset");
            Ok(MarkOutcome::Updated)
        } else {
            Ok(MarkOutcome::NotFound)
        }
    }

    async fn explain_refusal(&self, id: i64) -> Result<MarkOutcome> {
        Ok(match get_link(self.db.pool(), id).await? {
            Some(_) => MarkOutcome::AlreadyDownloaded,
            None => MarkOutcome::NotFound,
        })
    }
}
