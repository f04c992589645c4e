//! Operator settings model, normalisation and data directory resolution.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

static INTERVAL_TOKEN_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\s*(h|m|s)").expect("invalid interval regex"));

pub const DATA_DIR_ENV: &str = "HARVESTER_DATA_DIR";
pub const MIN_REFRESH_INTERVAL_SECS: u64 = 30;
pub const MIN_BACKFILL_INTERVAL_SECS: u64 = 15 * 60;

/// Default issue/billing poll interval.
fn default_refresh_interval_secs() -> u64 {
    5 * 60
}

/// Default interval between billing backfill runs.
fn default_backfill_interval_secs() -> u64 {
    6 * 60 * 60
}

/// Jira connection details.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct JiraSettings {
    pub url: String,
    pub user: String,
    pub pass: String,
}

impl JiraSettings {
    pub fn is_configured(&self) -> bool {
        !self.url.trim().is_empty() && !self.user.trim().is_empty()
    }
}

/// Harvest connection details.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct HarvestSettings {
    pub account_id: String,
    pub token: String,
}

impl HarvestSettings {
    pub fn is_configured(&self) -> bool {
        !self.account_id.trim().is_empty() && !self.token.trim().is_empty()
    }
}

/// Operator configuration persisted as a single record.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_backfill_interval_secs")]
    pub backfill_interval_secs: u64,
    pub jira: JiraSettings,
    pub harvest: HarvestSettings,
}

impl Default for Settings {
    /// Returns baseline settings when nothing has been persisted yet.
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
            backfill_interval_secs: default_backfill_interval_secs(),
            jira: JiraSettings::default(),
            harvest: HarvestSettings::default(),
        }
    }
}

impl Settings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(MIN_REFRESH_INTERVAL_SECS))
    }

    pub fn backfill_interval(&self) -> Duration {
        Duration::from_secs(self.backfill_interval_secs.max(MIN_BACKFILL_INTERVAL_SECS))
    }

    /// True when the Jira client must be rebuilt to reflect `other`.
    pub fn jira_changed(&self, other: &Settings) -> bool {
        self.jira != other.jira
    }

    /// True when the Harvest client must be rebuilt to reflect `other`.
    pub fn harvest_changed(&self, other: &Settings) -> bool {
        self.harvest != other.harvest
    }
}

/// Clamps intervals and trims credential fields.
pub fn normalize_settings(mut settings: Settings) -> Settings {
    settings.refresh_interval_secs = settings
        .refresh_interval_secs
        .max(MIN_REFRESH_INTERVAL_SECS);
    settings.backfill_interval_secs = settings
        .backfill_interval_secs
        .max(MIN_BACKFILL_INTERVAL_SECS);
    settings.jira.url = settings.jira.url.trim().trim_end_matches('/').to_string();
    settings.jira.user = settings.jira.user.trim().to_string();
    settings.harvest.account_id = settings.harvest.account_id.trim().to_string();
    settings.harvest.token = settings.harvest.token.trim().to_string();
    settings
}

/// Parses operator interval input such as `90s`, `5m` or `1h 30m`; a bare number means minutes.
pub fn parse_interval(input: &str) -> Option<Duration> {
    let normalized = input.trim().to_lowercase();
    if normalized.is_empty() {
        return None;
    }
    if let Ok(minutes) = normalized.parse::<u64>() {
        return Some(Duration::from_secs(minutes.checked_mul(60)?));
    }

    let mut seconds = 0u64;
    let mut matched = false;
    for capture in INTERVAL_TOKEN_REGEX.captures_iter(&normalized) {
        let value = capture[1].parse::<u64>().ok()?;
        let unit = match &capture[2] {
            "h" => 3600,
            "m" => 60,
            _ => 1,
        };
        seconds = seconds.checked_add(value.checked_mul(unit)?)?;
        matched = true;
    }

    if !matched || seconds == 0 {
        return None;
    }
    Some(Duration::from_secs(seconds))
}

/// Directory holding the local timer database and settings.
pub fn data_dir() -> Option<PathBuf> {
    if let Ok(dir) = env::var(DATA_DIR_ENV) {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    directories::ProjectDirs::from("com", "bah2830", "harvester")
        .map(|dirs| dirs.data_dir().to_path_buf())
}
