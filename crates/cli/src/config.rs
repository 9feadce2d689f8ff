use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use core_model::{MonitoredAccount, SyncError, TeamMember, normalize_address};
use ingest::MAX_WINDOW_DAYS;
use reconcile::SyncSettings;
use serde::Deserialize;

pub const ACCOUNTS_ENV: &str = "CONTACT_SYNC_ACCOUNTS";
pub const STORE_ENV: &str = "CONTACT_SYNC_STORE";
pub const KEY_ENV: &str = "CONTACT_SYNC_CLASSIFIER_KEY";
pub const POLL_INTERVAL_ENV: &str = "CONTACT_SYNC_POLL_INTERVAL";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_CLASSIFIER_TIMEOUT: Duration = Duration::from_secs(60);

/// Either `"a@x.com, b@y.com"` or `["a@x.com", "b@y.com"]`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AccountList {
    Csv(String),
    List(Vec<String>),
}

impl AccountList {
    fn addresses(&self) -> Vec<String> {
        match self {
            AccountList::Csv(raw) => split_accounts(raw),
            AccountList::List(items) => items.iter().flat_map(|i| split_accounts(i)).collect(),
        }
    }
}

/// The config file as written on disk. Every key is optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub store_path: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub classifier_key: Option<String>,
    /// Program plus arguments of an external classifier.
    pub classifier_command: Vec<String>,
    pub classifier_timeout: Option<String>,
    pub accounts: Option<AccountList>,
    pub team: Vec<TeamMember>,
    pub poll_interval: Option<String>,
    pub item_delay: Option<String>,
    pub lookback_hours: Option<i64>,
    pub history_days: Option<i64>,
    pub retention_days: Option<i64>,
    pub require_target_category: bool,
    pub target_keywords: Vec<String>,
    /// Fixed offset such as `"+02:00"`, or `"UTC"`.
    pub timezone: Option<String>,
}

/// Resolved configuration after file, environment and defaults are merged.
#[derive(Debug, Clone)]
pub struct Config {
    pub store_path: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub classifier_key: Option<String>,
    pub classifier_command: Vec<String>,
    pub classifier_timeout: Duration,
    pub poll_interval: Duration,
    pub retention_days: i64,
    pub target_keywords: Vec<String>,
    pub settings: SyncSettings,
}

impl Config {
    /// Reads `path`, or `<config_dir>/contact-sync/config.toml` when none is
    /// given, then applies environment overrides. A missing default file is
    /// not an error; a missing explicit one is.
    pub fn load(path: Option<&Path>) -> Result<Self, SyncError> {
        let (config_path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (default_config_path(), false),
        };
        let file = if !config_path.exists() && !explicit {
            FileConfig::default()
        } else {
            let content = std::fs::read_to_string(&config_path).map_err(|e| {
                SyncError::Configuration(format!(
                    "failed to read config file at {}: {e}",
                    config_path.display()
                ))
            })?;
            toml::from_str(&content).map_err(|e| {
                SyncError::Configuration(format!(
                    "failed to parse {}: {e}",
                    config_path.display()
                ))
            })?
        };
        Self::resolve(file, |name| std::env::var(name).ok())
    }

    pub fn resolve(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SyncError> {
        let addresses = match env(ACCOUNTS_ENV) {
            Some(raw) => split_accounts(&raw),
            None => file.accounts.as_ref().map(AccountList::addresses).unwrap_or_default(),
        };
        if addresses.is_empty() {
            return Err(SyncError::Configuration(format!(
                "no monitored accounts; set `accounts` in the config file or {ACCOUNTS_ENV}"
            )));
        }
        if let Some(bad) = addresses.iter().find(|a| !a.contains('@')) {
            return Err(SyncError::Configuration(format!(
                "`{bad}` is not an email address"
            )));
        }

        let poll_interval = match env(POLL_INTERVAL_ENV).or(file.poll_interval) {
            Some(raw) => parse_duration("poll_interval", &raw)?,
            None => DEFAULT_POLL_INTERVAL,
        };
        if poll_interval.is_zero() {
            return Err(SyncError::Configuration(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        let item_delay = match &file.item_delay {
            Some(raw) => parse_duration("item_delay", raw)?,
            None => Duration::ZERO,
        };
        let classifier_timeout = match &file.classifier_timeout {
            Some(raw) => parse_duration("classifier_timeout", raw)?,
            None => DEFAULT_CLASSIFIER_TIMEOUT,
        };
        let timezone = match &file.timezone {
            Some(raw) => parse_offset(raw)?,
            None => Utc.fix(),
        };

        let classifier_key = env(KEY_ENV).or(file.classifier_key).filter(|k| !k.is_empty());
        if !file.classifier_command.is_empty() && classifier_key.is_none() {
            return Err(SyncError::Configuration(format!(
                "classifier_command is set but no classifier key was given; set `classifier_key` or {KEY_ENV}"
            )));
        }

        let mut settings = SyncSettings {
            accounts: addresses.iter().map(|a| MonitoredAccount::new(a)).collect(),
            team: file
                .team
                .into_iter()
                .map(|m| TeamMember {
                    name: m.name.trim().to_string(),
                    address: normalize_address(&m.address),
                })
                .collect(),
            item_delay,
            require_target_category: file.require_target_category,
            timezone,
            ..SyncSettings::default()
        };
        if let Some(hours) = file.lookback_hours {
            let hours = bounded("lookback_hours", hours, MAX_WINDOW_DAYS * 24)?;
            settings.lookback = chrono::Duration::try_hours(hours).ok_or_else(|| {
                SyncError::Configuration(format!("lookback_hours {hours} overflows"))
            })?;
        }
        if let Some(days) = file.history_days {
            settings.history_days = bounded("history_days", days, MAX_WINDOW_DAYS)?;
        }
        let retention_days = match file.retention_days {
            Some(days) => bounded("retention_days", days, mailbox::MAX_RETENTION_DAYS)?,
            None => mailbox::DEFAULT_RETENTION_DAYS,
        };

        Ok(Self {
            store_path: env(STORE_ENV).map(PathBuf::from).or(file.store_path),
            data_dir: file.data_dir.unwrap_or_else(default_data_dir),
            classifier_key,
            classifier_command: file.classifier_command,
            classifier_timeout,
            poll_interval,
            retention_days,
            target_keywords: file.target_keywords,
            settings,
        })
    }

    pub fn account_addresses(&self) -> Vec<String> {
        self.settings
            .accounts
            .iter()
            .map(|a| a.address.clone())
            .collect()
    }

    pub fn mail_root(&self) -> PathBuf {
        self.data_dir.join("mail")
    }

    pub fn calendar_path(&self) -> PathBuf {
        self.data_dir.join("calendar.json")
    }
}

pub fn default_config_path() -> PathBuf {
    let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    config_dir.join("contact-sync").join("config.toml")
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("contact-sync")
}

fn split_accounts(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(normalize_address)
        .filter(|a| !a.is_empty())
        .collect()
}

/// Values below one are raised to one; values above `max` are rejected.
fn bounded(key: &str, value: i64, max: i64) -> Result<i64, SyncError> {
    if value > max {
        return Err(SyncError::Configuration(format!(
            "{key} must be at most {max}, got {value}"
        )));
    }
    Ok(value.max(1))
}

fn parse_duration(key: &str, raw: &str) -> Result<Duration, SyncError> {
    humantime::parse_duration(raw.trim())
        .map_err(|e| SyncError::Configuration(format!("invalid {key} `{raw}`: {e}")))
}

fn parse_offset(raw: &str) -> Result<FixedOffset, SyncError> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("utc") || raw == "Z" {
        return Ok(Utc.fix());
    }
    raw.parse::<FixedOffset>()
        .map_err(|e| SyncError::Configuration(format!("invalid timezone `{raw}`: {e}")))
}
