//! Run state persisted across cycles.
//!
//! The state file is only ever replaced whole: it is written to a sibling
//! temp file and renamed over the old one, so an interrupted cycle leaves
//! either the previous state or the new one, never a mix.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::Bucket;
use crate::error::{MonitorError, Result};

/// Current on-disk format version.
pub const STATE_VERSION: u32 = 1;

/// A lock file older than this is assumed to belong to a dead cycle.
pub const STALE_LOCK_AFTER: Duration = Duration::from_secs(2 * 60 * 60);

/// Dedup bookkeeping and learned color hints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunState {
    pub version: u32,
    /// When an alert was last delivered by any channel.
    pub last_alert_at: Option<DateTime<Utc>>,
    /// Qualifying total of that delivered alert.
    pub last_alert_total: Option<usize>,
    /// Most recent dispatch attempt, delivered or not.
    pub last_attempt: Option<AlertAttempt>,
    pub alerts_delivered: u64,
    pub failed_attempts: u64,
    /// Color to bucket, learned from rows that carried a timestamp.
    pub color_hints: BTreeMap<String, Bucket>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            last_alert_at: None,
            last_alert_total: None,
            last_attempt: None,
            alerts_delivered: 0,
            failed_attempts: 0,
            color_hints: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertAttempt {
    pub at: DateTime<Utc>,
    pub qualifying_total: usize,
    /// Channel that delivered, if any.
    pub delivered_by: Option<String>,
    /// Joined channel errors when nothing delivered.
    pub error: Option<String>,
}

impl RunState {
    /// Record a concluded dispatch attempt.
    ///
    /// Only a delivered attempt moves `last_alert_at`, so a failed page never
    /// suppresses the next cycle's retry.
    pub fn record_attempt(&mut self, attempt: AlertAttempt) {
        if attempt.delivered_by.is_some() {
            self.last_alert_at = Some(attempt.at);
            self.last_alert_total = Some(attempt.qualifying_total);
            self.alerts_delivered += 1;
        } else {
            self.failed_attempts += 1;
        }
        self.last_attempt = Some(attempt);
    }

    /// Merge color observations into the hints. Returns how many changed.
    pub fn learn_colors(&mut self, observed: &BTreeMap<String, Bucket>) -> usize {
        let mut changed = 0;
        for (color, bucket) in observed {
            if self.color_hints.insert(color.clone(), *bucket) != Some(*bucket) {
                changed += 1;
            }
        }
        changed
    }
}

/// Loads and atomically replaces the run state file.
#[derive(Debug, Clone)]
pub struct RunStateStore {
    path: PathBuf,
}

impl RunStateStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state; a missing file is a first run and yields the default.
    pub fn load(&self) -> Result<RunState> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "No run state yet, starting fresh");
                return Ok(RunState::default());
            }
            Err(e) => {
                return Err(MonitorError::State(format!(
                    "read {}: {e}",
                    self.path.display()
                )))
            }
        };

        let state: RunState = serde_json::from_str(&content).map_err(|e| {
            MonitorError::State(format!("corrupt state file {}: {e}", self.path.display()))
        })?;
        if state.version > STATE_VERSION {
            return Err(MonitorError::State(format!(
                "state file {} has version {}, newest supported is {STATE_VERSION}",
                self.path.display(),
                state.version
            )));
        }
        Ok(state)
    }

    /// Replace the state file.
    pub fn save(&self, state: &RunState) -> Result<()> {
        write_json_atomic(&self.path, state)
            .map_err(|e| MonitorError::State(format!("save {}: {e}", self.path.display())))?;
        tracing::debug!(path = %self.path.display(), "Saved run state");
        Ok(())
    }

    /// Move an unreadable state file aside so the next save starts clean.
    ///
    /// The file keeps its contents under `<stem>.corrupt-<utc>.json` next to
    /// the original. Returns the new path.
    pub fn quarantine(&self, now: DateTime<Utc>) -> Result<PathBuf> {
        let stem = self
            .path
            .file_stem()
            .map_or_else(|| "run_state".into(), |s| s.to_string_lossy());
        let aside = self
            .path
            .with_file_name(format!("{stem}.corrupt-{}.json", now.format("%Y%m%dT%H%M%SZ")));
        fs::rename(&self.path, &aside).map_err(|e| {
            MonitorError::State(format!(
                "move {} aside to {}: {e}",
                self.path.display(),
                aside.display()
            ))
        })?;
        tracing::warn!(
            path = %self.path.display(),
            moved_to = %aside.display(),
            "Moved unreadable run state aside"
        );
        Ok(aside)
    }

    /// Take the cycle lock next to the state file.
    pub fn lock(&self) -> Result<StateLock> {
        StateLock::acquire(self.path.with_extension("lock"))
    }
}

/// Exclusive hold on the state file for one cycle. Released on drop.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
}

impl StateLock {
    fn acquire(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        match Self::create(&path) {
            Ok(()) => return Ok(Self { path }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(MonitorError::State(format!(
                    "create lock {}: {e}",
                    path.display()
                )))
            }
        }

        let age = fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or_default();
        if age < STALE_LOCK_AFTER {
            return Err(MonitorError::State(format!(
                "another cycle holds {} (age {}s)",
                path.display(),
                age.as_secs()
            )));
        }

        tracing::warn!(path = %path.display(), age_secs = age.as_secs(), "Taking over stale lock");
        fs::remove_file(&path)?;
        Self::create(&path)
            .map_err(|e| MonitorError::State(format!("create lock {}: {e}", path.display())))?;
        Ok(Self { path })
    }

    fn create(path: &Path) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "{} {}", std::process::id(), Utc::now().to_rfc3339())
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release lock");
        }
    }
}

/// Write bytes to `path` via a sibling temp file and rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp_path, path)
}

pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}
