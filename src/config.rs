use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    ParseFile {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name}: {message}")]
    ParseEnv { name: String, message: String },
}

/// Application configuration.
///
/// Loaded from an optional TOML file and then overridden by environment
/// variables. Every section has usable defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub scheduler: SchedulerConfig,
    pub verifier: VerifierConfig,
    pub scraper: ScraperConfig,
    pub hub: HubConfig,
    pub downloads: DownloadsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    #[default]
    Release,
    Debug,
}

impl FromStr for ServerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "release" => Ok(Self::Release),
            "debug" => Ok(Self::Debug),
            other => Err(format!("expected 'release' or 'debug', got '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub mode: ServerMode,
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mode: ServerMode::Release,
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub assets_dir: PathBuf,
    /// SQLite file path, or a `sqlite:` URL.
    pub store_url: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            assets_dir: PathBuf::from("./assets"),
            store_url: "./data/media_vault.db".to_string(),
        }
    }
}

impl PathsConfig {
    /// Filesystem path of the store, with any `sqlite:` prefix removed.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        let raw = self
            .store_url
            .strip_prefix("sqlite://")
            .or_else(|| self.store_url.strip_prefix("sqlite:"))
            .unwrap_or(&self.store_url);
        PathBuf::from(raw)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    pub lease_secs: u64,
    /// Maximum due jobs fetched per tick.
    pub batch_size: i64,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            lease_secs: 60,
            batch_size: 64,
            backoff_base_secs: 60,
            backoff_cap_secs: 3600,
            shutdown_grace_secs: 5,
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    #[must_use]
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    pub worker_count: usize,
    pub default_ttl_days: i64,
    pub per_host_spacing_ms: u64,
    pub request_timeout_ms: u64,
    /// Consecutive network failures before a link is declared dead.
    pub failure_threshold: i64,
    pub poll_interval_secs: u64,
    pub poll_batch_size: i64,
    pub health_window: usize,
    /// Cooldown applied to rate-limited links when the provider has none.
    pub rate_limit_cooldown_secs: u64,
    pub user_agent: String,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            worker_count: 16,
            default_ttl_days: 7,
            per_host_spacing_ms: 1000,
            request_timeout_ms: 10_000,
            failure_threshold: 3,
            poll_interval_secs: 300,
            poll_batch_size: 100,
            health_window: 500,
            rate_limit_cooldown_secs: 900,
            user_agent: crate::constants::BROWSER_USER_AGENT.to_string(),
        }
    }
}

impl VerifierConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn per_host_spacing(&self) -> Duration {
        Duration::from_millis(self.per_host_spacing_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub request_timeout_ms: u64,
    pub max_pages_per_thread: u32,
    /// Threads scraped concurrently by a forum category run.
    pub concurrency: usize,
    pub per_origin_spacing_ms: u64,
    /// Per-host spacing overrides in milliseconds, keyed by host.
    pub origin_spacing_ms: HashMap<String, u64>,
    pub retry_attempts: u32,
    pub retry_base_ms: u64,
    pub user_agent: String,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            max_pages_per_thread: 50,
            concurrency: 4,
            per_origin_spacing_ms: 500,
            origin_spacing_ms: HashMap::new(),
            retry_attempts: 3,
            retry_base_ms: 1000,
            user_agent: crate::constants::BROWSER_USER_AGENT.to_string(),
        }
    }
}

impl ScraperConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Outbound messages buffered per observer.
    pub queue_depth: usize,
    /// Messages a slow observer may lose, since it last caught up, before it
    /// is disconnected.
    pub max_dropped: usize,
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_depth: 256,
            max_dropped: 1024,
            ping_interval_secs: 30,
            pong_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadsConfig {
    pub manager_url: String,
    pub destination_folder: Option<String>,
    pub autostart: bool,
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            manager_url: "http://localhost:3128".to_string(),
            destination_folder: None,
            autostart: true,
        }
    }
}

impl Config {
    /// Load configuration from `path` (if it exists) and apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or if
    /// an environment override is malformed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
                path: path.to_path_buf(),
                source,
            })?;
            toml::from_str(&raw).map_err(|source| ConfigError::ParseFile {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            Self::default()
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Load from the file named by `CONFIG_PATH` (default `./config.toml`).
    ///
    /// # Errors
    ///
    /// See [`Config::load`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = env_or_default("CONFIG_PATH", "./config.toml");
        Self::load(Path::new(&path))
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        override_from_env("SERVER_MODE", &mut self.server.mode)?;
        override_from_env("SERVER_HOST", &mut self.server.host)?;
        override_from_env("SERVER_PORT", &mut self.server.port)?;

        override_from_env("ASSETS_DIR", &mut self.paths.assets_dir)?;
        override_from_env("STORE_URL", &mut self.paths.store_url)?;
        // Older deployments name the store by path.
        override_from_env("DATABASE_PATH", &mut self.paths.store_url)?;

        override_from_env("SCHEDULER_TICK_INTERVAL_MS", &mut self.scheduler.tick_interval_ms)?;
        override_from_env("SCHEDULER_LEASE_SECS", &mut self.scheduler.lease_secs)?;
        override_from_env("SCHEDULER_BATCH_SIZE", &mut self.scheduler.batch_size)?;

        override_from_env("VERIFIER_WORKER_COUNT", &mut self.verifier.worker_count)?;
        override_from_env("VERIFIER_DEFAULT_TTL_DAYS", &mut self.verifier.default_ttl_days)?;
        override_from_env(
            "VERIFIER_PER_HOST_SPACING_MS",
            &mut self.verifier.per_host_spacing_ms,
        )?;
        override_from_env(
            "VERIFIER_REQUEST_TIMEOUT_MS",
            &mut self.verifier.request_timeout_ms,
        )?;
        override_from_env(
            "VERIFIER_POLL_INTERVAL_SECS",
            &mut self.verifier.poll_interval_secs,
        )?;

        override_from_env(
            "SCRAPER_REQUEST_TIMEOUT_MS",
            &mut self.scraper.request_timeout_ms,
        )?;
        override_from_env(
            "SCRAPER_MAX_PAGES_PER_THREAD",
            &mut self.scraper.max_pages_per_thread,
        )?;
        override_from_env("SCRAPER_CONCURRENCY", &mut self.scraper.concurrency)?;
        override_from_env(
            "SCRAPER_PER_ORIGIN_SPACING_MS",
            &mut self.scraper.per_origin_spacing_ms,
        )?;

        override_from_env("HUB_QUEUE_DEPTH", &mut self.hub.queue_depth)?;

        override_from_env("DOWNLOAD_MANAGER_URL", &mut self.downloads.manager_url)?;
        if let Some(folder) = optional_env("DOWNLOAD_DESTINATION_FOLDER") {
            self.downloads.destination_folder = Some(folder);
        }

        Ok(())
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.tick_interval_ms == 0 {
            return Err(invalid("scheduler.tick_interval", "must be at least 1 ms"));
        }
        if self.scheduler.lease_secs == 0 {
            return Err(invalid("scheduler.lease_secs", "must be at least 1"));
        }
        if self.scheduler.batch_size <= 0 {
            return Err(invalid("scheduler.batch_size", "must be at least 1"));
        }
        if self.scheduler.backoff_cap_secs < self.scheduler.backoff_base_secs {
            return Err(invalid(
                "scheduler.backoff_cap_secs",
                "must not be smaller than backoff_base_secs",
            ));
        }
        if self.verifier.worker_count == 0 {
            return Err(invalid("verifier.worker_count", "must be at least 1"));
        }
        if self.verifier.default_ttl_days < 0 {
            return Err(invalid("verifier.default_ttl_days", "cannot be negative"));
        }
        if self.verifier.failure_threshold <= 0 {
            return Err(invalid("verifier.failure_threshold", "must be at least 1"));
        }
        if self.verifier.health_window == 0 {
            return Err(invalid("verifier.health_window", "must be at least 1"));
        }
        if self.scraper.concurrency == 0 {
            return Err(invalid("scraper.concurrency", "must be at least 1"));
        }
        if self.scraper.max_pages_per_thread == 0 {
            return Err(invalid("scraper.max_pages_per_thread", "must be at least 1"));
        }
        if self.scraper.retry_attempts == 0 {
            return Err(invalid("scraper.retry_attempts", "must be at least 1"));
        }
        if self.hub.queue_depth == 0 {
            return Err(invalid("hub.queue_depth", "must be at least 1"));
        }
        if self.paths.store_url.trim().is_empty() {
            return Err(invalid("paths.store_url", "cannot be empty"));
        }
        Ok(())
    }

    /// Configuration suitable for tests: fast ticks, no politeness delays.
    #[must_use]
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.server.mode = ServerMode::Debug;
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config.scheduler.tick_interval_ms = 50;
        config.scheduler.lease_secs = 5;
        config.scheduler.backoff_base_secs = 1;
        config.scheduler.backoff_cap_secs = 4;
        config.scheduler.shutdown_grace_secs = 1;
        config.verifier.per_host_spacing_ms = 0;
        config.verifier.request_timeout_ms = 2000;
        config.verifier.poll_interval_secs = 3600;
        config.scraper.per_origin_spacing_ms = 0;
        config.scraper.request_timeout_ms = 2000;
        config.scraper.retry_base_ms = 10;
        config
    }
}

fn invalid(name: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message: message.to_string(),
    }
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_or_default(name: &str, default: &str) -> String {
    optional_env(name).unwrap_or_else(|| default.to_string())
}

fn override_from_env<T>(name: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = optional_env(name) {
        *target = raw.parse().map_err(|e: T::Err| ConfigError::ParseEnv {
            name: name.to_string(),
            message: e.to_string(),
        })?;
    }
    Ok(())
}
