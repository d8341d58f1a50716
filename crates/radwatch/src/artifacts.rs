//! Files written for the dashboard and for color-map tuning.
//!
//! Everything here is best-effort from the pipeline's point of view: a
//! failed write is logged and listed in the status errors, never fatal.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classify::{Basis, Bucket, BucketCounts, Tally};
use crate::dispatch::DispatchResult;
use crate::error::{MonitorError, Result};
use crate::state::{write_atomic, write_json_atomic};
use crate::worklist::FetchedPage;

pub const LAST_PAGE_HTML: &str = "last_page.html";
pub const LAST_PAGE_PNG: &str = "last_page.png";
pub const LAST_COUNTS_CSV: &str = "last_counts.csv";

/// Current `color_samples.json` format version.
pub const COLOR_SAMPLES_VERSION: u32 = 1;

// =============================================================================
// Status record
// =============================================================================

/// Page scrape statistics for one cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScrapeStats {
    /// URL or file the page came from.
    pub source: String,
    pub rows_seen: usize,
    pub rows_skipped: usize,
    /// Study records parsed, all modalities.
    pub records: usize,
    /// CT/MR records counted into buckets.
    pub counted: usize,
    /// Records with neither a timestamp nor a mapped color.
    pub ambiguous: usize,
    /// Records whose mapped color disagreed with the timestamp.
    pub color_mismatches: usize,
    /// Rows whose date/time cells did not parse.
    pub timestamp_errors: usize,
}

/// The dashboard's view of the latest cycle.
#[derive(Debug, Clone, Serialize)]
pub struct StatusRecord {
    pub run_id: Uuid,
    /// Local wall-clock time of the run, `YYYY-MM-DD HH:MM:SS`.
    pub last_run_local: String,
    pub last_run_utc: DateTime<Utc>,
    pub timezone: String,
    pub active_window: bool,
    pub window_description: String,
    pub counts: BucketCounts,
    pub qualifying_total: usize,
    pub threshold: usize,
    /// Qualifying total reached the threshold.
    pub threshold_met: bool,
    /// An alert was due this cycle (threshold met inside the window, or forced).
    pub alert_triggered: bool,
    pub forced: bool,
    pub dry_run: bool,
    pub notification_channels: Vec<String>,
    pub dispatch: Option<DispatchResult>,
    pub last_alert_at: Option<DateTime<Utc>>,
    pub scrape: ScrapeStats,
    pub errors: Vec<String>,
    pub last_error: Option<String>,
}

impl StatusRecord {
    /// Record an error; the most recent one becomes `last_error`.
    pub fn push_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.last_error = Some(error.clone());
        self.errors.push(error);
    }
}

/// Atomically write the status record.
pub fn write_status(path: &Path, status: &StatusRecord) -> Result<()> {
    write_json_atomic(path, status)?;
    tracing::debug!(path = %path.display(), "Wrote status record");
    Ok(())
}

// =============================================================================
// Debug snapshots
// =============================================================================

/// Save the raw page, and the screenshot when there is one.
pub fn save_page(dir: &Path, page: &FetchedPage) -> io::Result<()> {
    write_atomic(&dir.join(LAST_PAGE_HTML), page.html.as_bytes())?;
    if let Some(png) = &page.screenshot {
        write_atomic(&dir.join(LAST_PAGE_PNG), png)?;
    }
    Ok(())
}

#[derive(Serialize)]
struct CountsRow<'a> {
    bucket: &'static str,
    age_min: Option<i64>,
    identifier: &'a str,
    modality: &'static str,
    color: &'a str,
    basis: &'static str,
}

const fn basis_label(basis: Basis) -> &'static str {
    match basis {
        Basis::Timestamp => "timestamp",
        Basis::Color => "color",
        Basis::Unresolved => "none",
    }
}

/// Render every classified record as CSV.
pub fn counts_csv(tally: &Tally) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for study in &tally.studies {
        writer
            .serialize(CountsRow {
                bucket: study.classification.bucket.label(),
                age_min: study.classification.age_minutes,
                identifier: &study.record.identifier,
                modality: study.record.modality.as_str(),
                color: study.record.color.as_deref().unwrap_or_default(),
                basis: basis_label(study.classification.basis),
            })
            .map_err(|e| MonitorError::Io(io::Error::other(e)))?;
    }
    writer
        .into_inner()
        .map_err(|e| MonitorError::Io(io::Error::other(e.to_string())))
}

pub fn write_counts_csv(dir: &Path, tally: &Tally) -> Result<()> {
    let bytes = counts_csv(tally)?;
    write_atomic(&dir.join(LAST_COUNTS_CSV), &bytes)?;
    Ok(())
}

// =============================================================================
// Color samples
// =============================================================================

/// Observations of one row color across cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorSample {
    /// Bucket label to times seen on a timestamped row.
    pub buckets: BTreeMap<String, usize>,
    /// Times seen on a row with no timestamp and no mapping.
    pub unresolved: usize,
    pub last_seen: Option<DateTime<Utc>>,
}

impl ColorSample {
    /// Most frequently observed bucket; ties go to the less severe one.
    #[must_use]
    pub fn majority(&self) -> Option<Bucket> {
        let mut best: Option<(Bucket, usize)> = None;
        for (label, &count) in &self.buckets {
            let Some(bucket) = Bucket::parse(label) else {
                continue;
            };
            best = match best {
                Some((b, c)) if c > count || (c == count && b < bucket) => Some((b, c)),
                _ => Some((bucket, count)),
            };
        }
        best.map(|(bucket, _)| bucket)
    }
}

/// Accumulated `color_samples.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorSamples {
    pub version: u32,
    pub samples: BTreeMap<String, ColorSample>,
}

impl Default for ColorSamples {
    fn default() -> Self {
        Self {
            version: COLOR_SAMPLES_VERSION,
            samples: BTreeMap::new(),
        }
    }
}

impl ColorSamples {
    /// Load; a missing file yields an empty set.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)?;
        Ok(())
    }

    /// Fold one cycle's colored rows in. Returns how many rows were recorded.
    pub fn merge(&mut self, tally: &Tally, now: DateTime<Utc>) -> usize {
        let mut recorded = 0;
        for study in &tally.studies {
            let Some(color) = study
                .record
                .color
                .as_deref()
                .and_then(crate::classify::normalize_color)
            else {
                continue;
            };
            let sample = self.samples.entry(color).or_default();
            match study.classification.basis {
                Basis::Timestamp => {
                    *sample
                        .buckets
                        .entry(study.classification.bucket.label().to_string())
                        .or_default() += 1;
                }
                Basis::Unresolved => sample.unresolved += 1,
                Basis::Color => {}
            }
            sample.last_seen = Some(now);
            recorded += 1;
        }
        recorded
    }

    /// Majority bucket per color, for colors with timestamped observations.
    #[must_use]
    pub fn suggest_color_map(&self) -> BTreeMap<String, Bucket> {
        self.samples
            .iter()
            .filter_map(|(color, sample)| sample.majority().map(|b| (color.clone(), b)))
            .collect()
    }

    /// Colors that only ever showed up unresolved.
    #[must_use]
    pub fn unmapped(&self) -> Vec<&str> {
        self.samples
            .iter()
            .filter(|(_, s)| s.buckets.is_empty() && s.unresolved > 0)
            .map(|(c, _)| c.as_str())
            .collect()
    }
}

/// Render a suggested map as a `color_map:` YAML block.
pub fn color_map_yaml(map: &BTreeMap<String, Bucket>) -> Result<String> {
    #[derive(Serialize)]
    struct Block<'a> {
        color_map: &'a BTreeMap<String, Bucket>,
    }
    serde_yaml::to_string(&Block { color_map: map })
        .map_err(|e| MonitorError::Config(format!("render color map: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{Classification, ClassifiedStudy};
    use crate::worklist::{Modality, StudyRecord};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn study(color: Option<&str>, bucket: Bucket, basis: Basis, age: Option<i64>) -> ClassifiedStudy {
        ClassifiedStudy {
            record: StudyRecord {
                identifier: "DOE, JANE".to_string(),
                modality: Modality::Ct,
                study: "CT HEAD".to_string(),
                reported_at: None,
                color: color.map(str::to_string),
            },
            classification: Classification {
                bucket,
                basis,
                age_minutes: age,
                color_bucket: None,
            },
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 19, 23, 0, 0).unwrap()
    }

    #[test]
    fn test_counts_csv_layout() {
        let tally = Tally {
            counts: BucketCounts::default(),
            studies: vec![
                study(Some("#ffff00"), Bucket::Within90, Basis::Timestamp, Some(75)),
                study(None, Bucket::Other, Basis::Unresolved, None),
            ],
        };
        let csv = String::from_utf8(counts_csv(&tally).unwrap()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "bucket,age_min,identifier,modality,color,basis");
        assert_eq!(lines[1], "90,75,\"DOE, JANE\",CT,#ffff00,timestamp");
        assert_eq!(lines[2], "other,,\"DOE, JANE\",CT,,none");
    }

    #[test]
    fn test_color_samples_merge_and_suggest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("color_samples.json");

        let tally = Tally {
            counts: BucketCounts::default(),
            studies: vec![
                study(Some("#FF0"), Bucket::Within90, Basis::Timestamp, Some(80)),
                study(Some("#ffff00"), Bucket::Within90, Basis::Timestamp, Some(85)),
                study(Some("#ffff00"), Bucket::Within120, Basis::Timestamp, Some(95)),
                study(Some("pink"), Bucket::Other, Basis::Unresolved, None),
                study(None, Bucket::Other, Basis::Unresolved, None),
            ],
        };

        let mut samples = ColorSamples::load(&path).unwrap();
        assert_eq!(samples.merge(&tally, now()), 4);
        samples.save(&path).unwrap();

        let mut reloaded = ColorSamples::load(&path).unwrap();
        assert_eq!(reloaded, samples);
        reloaded.merge(&tally, now());

        let yellow = &reloaded.samples["#ffff00"];
        assert_eq!(yellow.buckets["90"], 4);
        assert_eq!(yellow.buckets["120"], 2);
        assert_eq!(reloaded.samples["pink"].unresolved, 2);

        let suggested = reloaded.suggest_color_map();
        assert_eq!(suggested.get("#ffff00"), Some(&Bucket::Within90));
        assert!(!suggested.contains_key("pink"));
        assert_eq!(reloaded.unmapped(), vec!["pink"]);
    }

    #[test]
    fn test_majority_tie_prefers_less_severe() {
        let sample = ColorSample {
            buckets: [("120".to_string(), 3), ("60".to_string(), 3)]
                .into_iter()
                .collect(),
            unresolved: 0,
            last_seen: None,
        };
        assert_eq!(sample.majority(), Some(Bucket::Within60));
    }

    #[test]
    fn test_color_map_yaml_reads_back() {
        let map: BTreeMap<String, Bucket> = [
            ("#ffc0cb".to_string(), Bucket::Within120),
            ("#ffff00".to_string(), Bucket::Within90),
        ]
        .into_iter()
        .collect();
        let yaml = color_map_yaml(&map).unwrap();
        let config = crate::config::MonitorConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.color_map, map);
    }

    #[test]
    fn test_save_page_with_screenshot() {
        let dir = TempDir::new().unwrap();
        let page = FetchedPage {
            html: "<html></html>".to_string(),
            screenshot: Some(vec![0x89, b'P', b'N', b'G']),
            source: "test".to_string(),
        };
        save_page(dir.path(), &page).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join(LAST_PAGE_HTML)).unwrap(),
            "<html></html>"
        );
        assert_eq!(fs::read(dir.path().join(LAST_PAGE_PNG)).unwrap().len(), 4);
    }

    #[test]
    fn test_push_error_tracks_last() {
        let mut status = StatusRecord {
            run_id: Uuid::new_v4(),
            last_run_local: String::new(),
            last_run_utc: now(),
            timezone: "America/New_York".to_string(),
            active_window: false,
            window_description: String::new(),
            counts: BucketCounts::default(),
            qualifying_total: 0,
            threshold: 20,
            threshold_met: false,
            alert_triggered: false,
            forced: false,
            dry_run: false,
            notification_channels: vec![],
            dispatch: None,
            last_alert_at: None,
            scrape: ScrapeStats::default(),
            errors: vec![],
            last_error: None,
        };
        status.push_error("first");
        status.push_error("second");
        assert_eq!(status.errors, vec!["first", "second"]);
        assert_eq!(status.last_error.as_deref(), Some("second"));
    }
}
