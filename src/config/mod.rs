pub mod secrets;

use anyhow::{bail, Context, Result};
use chrono::{NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::crypto::HashParams;

pub const MAX_ACCESS_TOKEN_MINUTES: i64 = 24 * 60;
pub const MAX_REFRESH_TOKEN_DAYS: i64 = 10 * 365;
pub const MAX_INTERVAL_MINUTES: u64 = 7 * 24 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub spotify: SpotifyConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Mark session cookies `Secure`. Enable whenever the service sits behind TLS.
    #[serde(default)]
    pub secure_cookies: bool,
    /// Base URL the scheduled jobs use to reach this service's own API.
    /// Defaults to the loopback address on `port`.
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
            secure_cookies: false,
            public_url: None,
        }
    }
}

impl ServerConfig {
    pub fn api_base_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://127.0.0.1:{}", self.port),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Bootstrap admin, required only while no admin account exists
    pub admin_email: Option<String>,
    pub admin_password: Option<String>,
    /// Service account used by scheduled jobs. Set both or neither.
    pub service_email: Option<String>,
    pub service_password: Option<String>,
    #[serde(default = "default_access_token_minutes")]
    pub access_token_minutes: i64,
    #[serde(default = "default_refresh_token_days")]
    pub refresh_token_days: i64,
    /// `kid` header stamped on access tokens
    #[serde(default = "default_key_id")]
    pub key_id: String,
    #[serde(default)]
    pub password: HashParams,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_email: None,
            admin_password: None,
            service_email: None,
            service_password: None,
            access_token_minutes: default_access_token_minutes(),
            refresh_token_days: default_refresh_token_days(),
            key_id: default_key_id(),
            password: HashParams::default(),
        }
    }
}

fn default_access_token_minutes() -> i64 {
    30
}

fn default_refresh_token_days() -> i64 {
    14
}

fn default_key_id() -> String {
    "1".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpotifyConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    #[serde(default = "default_accounts_url")]
    pub accounts_url: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Retries for transient failures (connection errors, 429, 5xx)
    #[serde(default = "default_http_retries")]
    pub http_retries: u32,
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            redirect_uri: None,
            accounts_url: default_accounts_url(),
            api_url: default_api_url(),
            http_retries: default_http_retries(),
        }
    }
}

fn default_accounts_url() -> String {
    "https://accounts.spotify.com".to_string()
}

fn default_api_url() -> String {
    "https://api.spotify.com".to_string()
}

fn default_http_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// IANA zone for calendar triggers and playlist date ranges
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_token_refresh_minutes")]
    pub token_refresh_minutes: u64,
    #[serde(default = "default_track_sync_minutes")]
    pub track_sync_minutes: u64,
    #[serde(default)]
    pub weekly: WeeklyTrigger,
    #[serde(default)]
    pub monthly: MonthlyTrigger,
    /// Users fetched per sweep
    #[serde(default = "default_user_page_size")]
    pub user_page_size: u32,
    /// Per-user tasks allowed in flight at once; 0 means unbounded
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_http_retries")]
    pub http_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timezone: default_timezone(),
            token_refresh_minutes: default_token_refresh_minutes(),
            track_sync_minutes: default_track_sync_minutes(),
            weekly: WeeklyTrigger::default(),
            monthly: MonthlyTrigger::default(),
            user_page_size: default_user_page_size(),
            max_concurrency: default_max_concurrency(),
            http_retries: default_http_retries(),
        }
    }
}

impl SchedulerConfig {
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("invalid scheduler timezone {:?}: {}", self.timezone, e))
    }
}

fn default_true() -> bool {
    true
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}

fn default_token_refresh_minutes() -> u64 {
    30
}

fn default_track_sync_minutes() -> u64 {
    10
}

fn default_user_page_size() -> u32 {
    100
}

fn default_max_concurrency() -> usize {
    8
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeeklyTrigger {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_weekday")]
    pub weekday: Weekday,
    #[serde(default = "default_hour")]
    pub hour: u32,
    #[serde(default)]
    pub minute: u32,
}

impl Default for WeeklyTrigger {
    fn default() -> Self {
        Self {
            enabled: true,
            weekday: default_weekday(),
            hour: default_hour(),
            minute: 0,
        }
    }
}

impl WeeklyTrigger {
    pub fn time(&self) -> Result<NaiveTime> {
        trigger_time(self.hour, self.minute)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonthlyTrigger {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 1..=28 so every month has the day
    #[serde(default = "default_day_of_month")]
    pub day: u32,
    #[serde(default = "default_hour")]
    pub hour: u32,
    #[serde(default)]
    pub minute: u32,
}

impl Default for MonthlyTrigger {
    fn default() -> Self {
        Self {
            enabled: true,
            day: default_day_of_month(),
            hour: default_hour(),
            minute: 0,
        }
    }
}

impl MonthlyTrigger {
    pub fn time(&self) -> Result<NaiveTime> {
        trigger_time(self.hour, self.minute)
    }
}

fn default_weekday() -> Weekday {
    Weekday::Fri
}

fn default_hour() -> u32 {
    17
}

fn default_day_of_month() -> u32 {
    1
}

fn trigger_time(hour: u32, minute: u32) -> Result<NaiveTime> {
    NaiveTime::from_hms_opt(hour, minute, 0)
        .with_context(|| format!("invalid trigger time {:02}:{:02}", hour, minute))
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Values supplied on the command line or through the environment. They take
/// precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub admin_email: Option<String>,
    pub admin_password: Option<String>,
    pub service_email: Option<String>,
    pub service_password: Option<String>,
    pub spotify_client_id: Option<String>,
    pub spotify_client_secret: Option<String>,
    pub spotify_redirect_uri: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config =
                toml::from_str(&content).with_context(|| "Failed to parse configuration file")?;
            Ok(config)
        } else {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }

    pub fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            spotify: SpotifyConfig::default(),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn apply_overrides(&mut self, overrides: Overrides) {
        fn set(slot: &mut Option<String>, value: Option<String>) {
            if let Some(v) = value.filter(|v| !v.is_empty()) {
                *slot = Some(v);
            }
        }

        set(&mut self.auth.admin_email, overrides.admin_email);
        set(&mut self.auth.admin_password, overrides.admin_password);
        set(&mut self.auth.service_email, overrides.service_email);
        set(&mut self.auth.service_password, overrides.service_password);
        set(&mut self.spotify.client_id, overrides.spotify_client_id);
        set(&mut self.spotify.client_secret, overrides.spotify_client_secret);
        set(&mut self.spotify.redirect_uri, overrides.spotify_redirect_uri);
    }

    /// Reject settings that would only fail later, at request or trigger time.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_ACCESS_TOKEN_MINUTES).contains(&self.auth.access_token_minutes) {
            bail!(
                "auth.access_token_minutes must be between 1 and {}",
                MAX_ACCESS_TOKEN_MINUTES
            );
        }
        if !(1..=MAX_REFRESH_TOKEN_DAYS).contains(&self.auth.refresh_token_days) {
            bail!(
                "auth.refresh_token_days must be between 1 and {}",
                MAX_REFRESH_TOKEN_DAYS
            );
        }
        if self.auth.key_id.is_empty() {
            bail!("auth.key_id must not be empty");
        }

        let scheduler = &self.scheduler;
        scheduler.tz()?;
        scheduler.weekly.time()?;
        scheduler.monthly.time()?;
        if !(1..=28).contains(&scheduler.monthly.day) {
            bail!(
                "scheduler.monthly.day must be between 1 and 28, got {}",
                scheduler.monthly.day
            );
        }
        for (name, minutes) in [
            ("token_refresh_minutes", scheduler.token_refresh_minutes),
            ("track_sync_minutes", scheduler.track_sync_minutes),
        ] {
            if !(1..=MAX_INTERVAL_MINUTES).contains(&minutes) {
                bail!(
                    "scheduler.{} must be between 1 and {}",
                    name,
                    MAX_INTERVAL_MINUTES
                );
            }
        }
        if scheduler.user_page_size == 0 {
            bail!("scheduler.user_page_size must be positive");
        }
        Ok(())
    }
}
