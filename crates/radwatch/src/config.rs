//! Monitor configuration.
//!
//! Settings come from a YAML file (every field optional) with secrets
//! overridden from environment variables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::classify::Bucket;

/// Default local zone of the monitored site.
pub const DEFAULT_TIMEZONE: &str = "America/New_York";

/// Default qualifying-total threshold (inclusive).
pub const DEFAULT_THRESHOLD: usize = 20;

/// Default resend cooldown.
pub const DEFAULT_COOLDOWN_MINUTES: i64 = 60;

/// Default per-send notification timeout.
pub const DEFAULT_SEND_TIMEOUT_SECS: u64 = 20;

/// Default page fetch timeout.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// IANA zone the worklist and active windows are expressed in.
    pub timezone: String,
    /// Qualifying total at or above which an alert triggers.
    pub threshold: usize,
    pub resend: ResendConfig,
    pub active_windows: ActiveWindows,
    pub selectors: Selectors,
    /// Row color to bucket.
    pub color_map: BTreeMap<String, Bucket>,
    /// Let colors learned from timestamped rows fill gaps in `color_map`.
    pub use_learned_colors: bool,
    pub source: SourceConfig,
    pub notification: NotificationConfig,
    /// Ordered list of people to page.
    pub contacts: Vec<Contact>,
    pub paths: PathsConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            timezone: DEFAULT_TIMEZONE.to_string(),
            threshold: DEFAULT_THRESHOLD,
            resend: ResendConfig::default(),
            active_windows: ActiveWindows::default(),
            selectors: Selectors::default(),
            color_map: BTreeMap::new(),
            use_learned_colors: true,
            source: SourceConfig::default(),
            notification: NotificationConfig::default(),
            contacts: Vec::new(),
            paths: PathsConfig::default(),
        }
    }
}

/// When a still-triggered alert may be sent again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResendPolicy {
    /// Send every triggered cycle.
    Always,
    /// Send again only after the cooldown has elapsed.
    Cooldown,
    /// Send again after the cooldown, or sooner if the total went up.
    OnIncrease,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResendConfig {
    pub policy: ResendPolicy,
    pub cooldown_minutes: i64,
}

impl Default for ResendConfig {
    fn default() -> Self {
        Self {
            policy: ResendPolicy::OnIncrease,
            cooldown_minutes: DEFAULT_COOLDOWN_MINUTES,
        }
    }
}

impl ResendConfig {
    #[must_use]
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.cooldown_minutes)
    }
}

/// Inclusive `HH:MM` range within one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayWindow {
    pub start: String,
    pub end: String,
}

impl DayWindow {
    fn new(start: &str, end: &str) -> Self {
        Self {
            start: start.to_string(),
            end: end.to_string(),
        }
    }

    /// Parse both ends, requiring `start <= end`.
    pub fn parse(&self) -> Result<(NaiveTime, NaiveTime)> {
        let start = NaiveTime::parse_from_str(self.start.trim(), "%H:%M")
            .with_context(|| format!("invalid window start `{}` (expected HH:MM)", self.start))?;
        let end = NaiveTime::parse_from_str(self.end.trim(), "%H:%M")
            .with_context(|| format!("invalid window end `{}` (expected HH:MM)", self.end))?;
        if start > end {
            bail!("window start {} is after end {}", self.start, self.end);
        }
        Ok((start, end))
    }
}

/// Per-day alerting windows. `None` means never active that day.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActiveWindows {
    pub monday: Option<DayWindow>,
    pub tuesday: Option<DayWindow>,
    pub wednesday: Option<DayWindow>,
    pub thursday: Option<DayWindow>,
    pub friday: Option<DayWindow>,
    pub saturday: Option<DayWindow>,
    pub sunday: Option<DayWindow>,
}

impl Default for ActiveWindows {
    fn default() -> Self {
        let weekday = || Some(DayWindow::new("18:00", "23:59"));
        Self {
            monday: weekday(),
            tuesday: weekday(),
            wednesday: weekday(),
            thursday: weekday(),
            friday: weekday(),
            saturday: Some(DayWindow::new("04:00", "23:59")),
            sunday: Some(DayWindow::new("00:00", "21:00")),
        }
    }
}

impl ActiveWindows {
    /// Windows indexed Monday = 0 .. Sunday = 6.
    #[must_use]
    pub fn by_weekday(&self) -> [Option<&DayWindow>; 7] {
        [
            self.monday.as_ref(),
            self.tuesday.as_ref(),
            self.wednesday.as_ref(),
            self.thursday.as_ref(),
            self.friday.as_ref(),
            self.saturday.as_ref(),
            self.sunday.as_ref(),
        ]
    }
}

/// How to locate the worklist table and its columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Selectors {
    /// CSS selector for candidate tables.
    pub table: String,
    /// Header text the worklist table must contain.
    pub required_header: String,
    /// Header text that marks a table to ignore (completed studies).
    pub excluded_header: String,
    /// CSS selector for rows within the table.
    pub row: String,
    pub columns: Columns,
    /// Rows with fewer cells are ignored.
    pub min_cells: usize,
    /// chrono format for the joined date and time cells.
    pub timestamp_format: String,
}

impl Default for Selectors {
    fn default() -> Self {
        Self {
            table: "table".to_string(),
            required_header: "Study Requested".to_string(),
            excluded_header: "Report Out Time".to_string(),
            row: "tr".to_string(),
            columns: Columns::default(),
            min_cells: 7,
            timestamp_format: "%b %d, %Y %H:%M:%S".to_string(),
        }
    }
}

/// Zero-based cell indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Columns {
    pub identifier: usize,
    pub date: usize,
    /// Same as `date` when one cell holds both.
    pub time: usize,
    pub study: usize,
}

impl Default for Columns {
    fn default() -> Self {
        Self {
            identifier: 2,
            date: 4,
            time: 5,
            study: 6,
        }
    }
}

/// Worklist site and credentials, handed to the fetcher as-is.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Tried in order until one works.
    pub base_urls: Vec<String>,
    pub index_path: String,
    pub worklist_path: String,
    pub timeout_secs: u64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_urls: vec![
                "https://www.avrteleris.com/AVR".to_string(),
                "https://avrteleris.com/AVR".to_string(),
            ],
            index_path: "Index.aspx".to_string(),
            worklist_path: "Forms/Worklist/worklist.aspx".to_string(),
            timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            username: String::new(),
            password: String::new(),
        }
    }
}

impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("base_urls", &self.base_urls)
            .field("index_path", &self.index_path)
            .field("worklist_path", &self.worklist_path)
            .field("timeout_secs", &self.timeout_secs)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Twilio SMS (tried first).
    pub primary: TwilioSettings,
    /// SMTP email-to-SMS (tried second).
    pub secondary: SmtpSettings,
    /// Telegram (tried last).
    pub telegram: TelegramSettings,
    /// Per-channel send timeout; zero means the default.
    pub send_timeout_secs: u64,
}

impl NotificationConfig {
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        if self.send_timeout_secs == 0 {
            Duration::from_secs(DEFAULT_SEND_TIMEOUT_SECS)
        } else {
            Duration::from_secs(self.send_timeout_secs)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TwilioSettings {
    pub account_sid: String,
    #[serde(skip_serializing)]
    pub auth_token: String,
    pub from_number: String,
    /// Override for testing; blank means the public API.
    pub api_base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub from_address: String,
}

impl Default for SmtpSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: notify::channels::email::DEFAULT_SMTP_PORT,
            username: String::new(),
            password: String::new(),
            from_address: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramSettings {
    #[serde(skip_serializing)]
    pub bot_token: String,
    pub chat_ids: Vec<i64>,
    pub api_base: String,
}

/// A person to page, by phone and/or carrier gateway address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    /// Carrier email-to-SMS address, e.g. `5551234567@vtext.com`.
    #[serde(default)]
    pub sms_gateway: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Persisted run state (dedup bookkeeping).
    pub state: PathBuf,
    /// Status record for the dashboard.
    pub status: PathBuf,
    /// Debug snapshots and color samples.
    pub artifacts_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state: PathBuf::from("state/run_state.json"),
            status: PathBuf::from("status.json"),
            artifacts_dir: PathBuf::from("docs"),
        }
    }
}

impl PathsConfig {
    #[must_use]
    pub fn color_samples(&self) -> PathBuf {
        self.artifacts_dir.join("color_samples.json")
    }
}

impl MonitorConfig {
    /// Load from `path` (defaults if the file is missing), apply environment
    /// overrides, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::from_yaml(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };

        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML; an empty document yields defaults.
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Override secrets and site settings from the environment.
    ///
    /// Blank values are ignored so an unset secret in CI does not wipe a
    /// value from the file.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let set = |name: &str, target: &mut String| {
            if let Some(v) = get(name) {
                *target = v;
            }
        };
        set("TIMEZONE", &mut self.timezone);
        set("WORKLIST_USERNAME", &mut self.source.username);
        set("WORKLIST_PASSWORD", &mut self.source.password);
        set("TWILIO_ACCOUNT_SID", &mut self.notification.primary.account_sid);
        set("TWILIO_AUTH_TOKEN", &mut self.notification.primary.auth_token);
        set("TWILIO_FROM_NUMBER", &mut self.notification.primary.from_number);
        set("SMTP_HOST", &mut self.notification.secondary.host);
        set("SMTP_USERNAME", &mut self.notification.secondary.username);
        set("SMTP_PASSWORD", &mut self.notification.secondary.password);
        set("SMTP_FROM", &mut self.notification.secondary.from_address);
        set("TELEGRAM_BOT_TOKEN", &mut self.notification.telegram.bot_token);

        if let Some(raw) = get("TELEGRAM_CHAT_IDS") {
            self.notification.telegram.chat_ids = notify::parse_chat_ids(&raw);
        }
    }

    /// Check everything that would otherwise fail mid-cycle.
    pub fn validate(&self) -> Result<()> {
        self.tz()?;
        if self.threshold == 0 {
            bail!("threshold must be at least 1");
        }
        if self.resend.cooldown_minutes < 0 {
            bail!("resend.cooldown_minutes must not be negative");
        }
        for (day, window) in DAY_NAMES.iter().zip(self.active_windows.by_weekday()) {
            if let Some(window) = window {
                window
                    .parse()
                    .with_context(|| format!("active_windows.{day}"))?;
            }
        }
        Ok(())
    }

    /// The configured zone.
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("invalid timezone `{}`: {e}", self.timezone))
    }

    /// Phone numbers of contacts, in order.
    #[must_use]
    pub fn phone_numbers(&self) -> Vec<String> {
        self.contacts
            .iter()
            .filter_map(|c| c.phone.clone())
            .filter(|p| !p.trim().is_empty())
            .collect()
    }

    /// Email-to-SMS gateway addresses of contacts, in order.
    #[must_use]
    pub fn sms_gateways(&self) -> Vec<String> {
        self.contacts
            .iter()
            .filter_map(|c| c.sms_gateway.clone())
            .filter(|g| !g.trim().is_empty())
            .collect()
    }

    /// Contact names for the alert text.
    #[must_use]
    pub fn contact_names(&self) -> Vec<String> {
        self.contacts.iter().map(|c| c.name.clone()).collect()
    }
}

pub(crate) const DAY_NAMES: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];
