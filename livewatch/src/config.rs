//! Application configuration.
//!
//! Loaded from a TOML file after `.env` has been applied. A handful of
//! environment variables override file values so deployments can keep one
//! file across hosts.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::database::MaintenanceConfig;
use crate::monitor::{ConfirmationPolicy, SitePollSettings};
use crate::notification::{FanoutPolicy, TelegramConfig};
use crate::sites::{PayloadFormat, SiteKind};
use crate::utils::http_client::HttpClientSettings;
use crate::{Error, Result};

pub const CONFIG_PATH_ENV: &str = "LIVEWATCH_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "livewatch.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub log_dir: String,
    pub confirmation: ConfirmationSection,
    pub notifications: NotificationSection,
    pub http: HttpSection,
    pub maintenance: MaintenanceSection,
    pub telegram: TelegramConfig,
    pub sites: Vec<SiteConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:livewatch.db?mode=rwc".to_string(),
            log_dir: "logs".to_string(),
            confirmation: ConfirmationSection::default(),
            notifications: NotificationSection::default(),
            http: HttpSection::default(),
            maintenance: MaintenanceSection::default(),
            telegram: TelegramConfig::default(),
            sites: Vec::new(),
        }
    }
}

/// Debounce windows and the confirmation sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationSection {
    pub online_confirm_secs: u64,
    pub offline_confirm_secs: u64,
    pub not_found_confirm_secs: u64,
    pub denied_confirm_secs: u64,
    pub sweep_period_secs: u64,
}

impl Default for ConfirmationSection {
    fn default() -> Self {
        let policy = ConfirmationPolicy::default();
        Self {
            online_confirm_secs: policy.online.as_secs(),
            offline_confirm_secs: policy.offline.as_secs(),
            not_found_confirm_secs: policy.not_found.as_secs(),
            denied_confirm_secs: policy.denied.as_secs(),
            sweep_period_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSection {
    pub dispatch_period_secs: u64,
    pub batch_size: i64,
    pub block_threshold: i64,
    /// Consecutive not-found answers after which an entity's subscriptions
    /// are dropped.
    pub not_found_threshold: i64,
    pub social: bool,
}

impl Default for NotificationSection {
    fn default() -> Self {
        let fanout = FanoutPolicy::default();
        Self {
            dispatch_period_secs: 2,
            batch_size: crate::notification::dispatcher::DEFAULT_BATCH_SIZE,
            block_threshold: fanout.block_threshold,
            not_found_threshold: ConfirmationPolicy::default().not_found_threshold,
            social: fanout.social,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub timeout_secs: u64,
    /// Local addresses to bind one client each; empty uses the default route.
    pub source_addresses: Vec<IpAddr>,
    pub user_agent: Option<String>,
    pub proxy_url: Option<String>,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            timeout_secs: HttpClientSettings::default().request_timeout.as_secs(),
            source_addresses: Vec::new(),
            user_agent: None,
            proxy_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceSection {
    pub period_secs: u64,
    pub status_log_retention_days: u32,
    pub delete_orphans: bool,
}

impl Default for MaintenanceSection {
    fn default() -> Self {
        let config = MaintenanceConfig::default();
        Self {
            period_secs: config.interval.as_secs(),
            status_log_retention_days: config.status_log_retention_days,
            delete_orphans: config.delete_orphans,
        }
    }
}

/// One `[[sites]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub name: String,
    pub kind: SiteKind,
    #[serde(default)]
    pub listing_url: Option<String>,
    /// Single-entity endpoint, `{id}` is substituted.
    #[serde(default)]
    pub single_url: Option<String>,
    /// Multi-entity endpoint, `{ids}` is substituted with a comma list.
    #[serde(default)]
    pub many_url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub format: PayloadFormat,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Pause between consecutive upstream queries.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub specials: Vec<String>,
}

fn default_batch_size() -> usize {
    50
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_interval_ms() -> u64 {
    500
}

fn default_queue_capacity() -> usize {
    crate::monitor::daemon::DEFAULT_QUEUE_CAPACITY
}

impl SiteConfig {
    pub fn poll_settings(&self) -> SitePollSettings {
        SitePollSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            query_interval: Duration::from_millis(self.interval_ms),
            queue_capacity: self.queue_capacity,
            specials: self.specials.clone(),
        }
    }
}

impl AppConfig {
    /// Load `.env`, then the file named by `LIVEWATCH_CONFIG` (or
    /// `livewatch.toml`), then apply environment overrides and validate.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_file(Path::new(&path))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::config(format!("invalid config: {}", e)))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database_url = url;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            self.log_dir = dir;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sites.is_empty() {
            return Err(Error::config("no sites configured"));
        }
        if self.notifications.batch_size <= 0 {
            return Err(Error::config("notifications.batch_size must be positive"));
        }

        let mut names = HashSet::new();
        for site in &self.sites {
            if site.name.is_empty() {
                return Err(Error::config("site name must not be empty"));
            }
            if !names.insert(site.name.as_str()) {
                return Err(Error::config(format!("duplicate site name {}", site.name)));
            }
            if site.queue_capacity == 0 {
                return Err(Error::config(format!(
                    "site {} needs a positive queue_capacity",
                    site.name
                )));
            }
            if site.batch_size == 0 {
                return Err(Error::config(format!(
                    "site {} needs a positive batch_size",
                    site.name
                )));
            }
            if site.poll_interval_secs == 0 {
                return Err(Error::config(format!(
                    "site {} needs a positive poll_interval_secs",
                    site.name
                )));
            }
        }
        Ok(())
    }

    pub fn confirmation_policy(&self) -> ConfirmationPolicy {
        ConfirmationPolicy {
            online: Duration::from_secs(self.confirmation.online_confirm_secs),
            offline: Duration::from_secs(self.confirmation.offline_confirm_secs),
            not_found: Duration::from_secs(self.confirmation.not_found_confirm_secs),
            denied: Duration::from_secs(self.confirmation.denied_confirm_secs),
            not_found_threshold: self.notifications.not_found_threshold,
        }
    }

    pub fn fanout_policy(&self) -> FanoutPolicy {
        FanoutPolicy {
            block_threshold: self.notifications.block_threshold,
            social: self.notifications.social,
        }
    }

    pub fn http_settings(&self) -> HttpClientSettings {
        let defaults = HttpClientSettings::default();
        HttpClientSettings {
            request_timeout: Duration::from_secs(self.http.timeout_secs),
            user_agent: self.http.user_agent.clone().unwrap_or(defaults.user_agent),
            proxy_url: self.http.proxy_url.clone(),
        }
    }

    pub fn maintenance_config(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            interval: Duration::from_secs(self.maintenance.period_secs),
            status_log_retention_days: self.maintenance.status_log_retention_days,
            delete_orphans: self.maintenance.delete_orphans,
        }
    }

    pub fn sweep_period(&self) -> Duration {
        Duration::from_secs(self.confirmation.sweep_period_secs.max(1))
    }

    pub fn dispatch_period(&self) -> Duration {
        Duration::from_secs(self.notifications.dispatch_period_secs.max(1))
    }
}
