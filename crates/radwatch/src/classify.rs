//! Elapsed-time bucketing of worklist studies.
//!
//! Timestamps are the primary signal. Row color is a best-effort fallback
//! that only applies when the timestamp is missing; when both exist and
//! disagree the timestamp wins and the disagreement is reported.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};

use crate::worklist::{Modality, StudyRecord};

/// Elapsed-time category, ordered by severity.
///
/// Intervals are closed on the right: (0,60], (60,90], (90,120], (120,∞).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Bucket {
    #[serde(rename = "60")]
    Within60,
    #[serde(rename = "90")]
    Within90,
    #[serde(rename = "120")]
    Within120,
    #[serde(rename = "other")]
    Other,
}

impl Bucket {
    /// Buckets that count toward the alert threshold.
    pub const QUALIFYING: [Self; 3] = [Self::Within60, Self::Within90, Self::Within120];

    /// Bucket for an elapsed age in minutes.
    ///
    /// Boundaries belong to the lower bucket: 60.0 is `Within60`, 60.01 is
    /// `Within90`. Non-positive ages (clock skew) land in `Within60`.
    #[must_use]
    pub fn from_elapsed_minutes(minutes: f64) -> Self {
        if minutes <= 60.0 {
            Self::Within60
        } else if minutes <= 90.0 {
            Self::Within90
        } else if minutes <= 120.0 {
            Self::Within120
        } else {
            Self::Other
        }
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Within60 => "60",
            Self::Within90 => "90",
            Self::Within120 => "120",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().trim_start_matches("<=").trim_start_matches('≤') {
            "60" => Some(Self::Within60),
            "90" => Some(Self::Within90),
            "120" => Some(Self::Within120),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_qualifying(&self) -> bool {
        !matches!(self, Self::Other)
    }
}

// Accepts `60` as a number as well as `"60"`, since YAML maps write it bare.
impl<'de> Deserialize<'de> for Bucket {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        let label = match Raw::deserialize(deserializer)? {
            Raw::Number(n) => n.to_string(),
            Raw::Text(s) => s,
        };
        Self::parse(&label).ok_or_else(|| {
            de::Error::custom(format!(
                "unknown bucket `{label}` (expected 60, 90, 120 or other)"
            ))
        })
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other => f.write_str("other"),
            _ => write!(f, "≤{}", self.label()),
        }
    }
}

/// Normalize a CSS color so page variants compare equal.
///
/// Lowercases, expands `#abc` to `#aabbcc`, and converts `rgb(r, g, b)` to hex.
/// Named colors pass through lowercased.
#[must_use]
pub fn normalize_color(raw: &str) -> Option<String> {
    let c = raw.trim().trim_end_matches(';').trim().to_ascii_lowercase();
    if c.is_empty() || c == "transparent" || c == "inherit" || c == "none" {
        return None;
    }

    if let Some(hex) = c.strip_prefix('#') {
        if hex.len() == 3 && hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
            let expanded: String = hex.chars().flat_map(|ch| [ch, ch]).collect();
            return Some(format!("#{expanded}"));
        }
        return Some(c);
    }

    if let Some(inner) = c
        .strip_prefix("rgba(")
        .or_else(|| c.strip_prefix("rgb("))
        .and_then(|rest| rest.strip_suffix(')'))
    {
        let parts: Vec<u8> = inner
            .split(',')
            .take(3)
            .filter_map(|p| p.trim().parse().ok())
            .collect();
        if parts.len() == 3 {
            return Some(format!("#{:02x}{:02x}{:02x}", parts[0], parts[1], parts[2]));
        }
        return None;
    }

    Some(c)
}

/// Row color to bucket lookup, with normalized keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColorMap {
    entries: BTreeMap<String, Bucket>,
}

impl ColorMap {
    /// Build from configured entries; unparseable colors are dropped.
    #[must_use]
    pub fn new(entries: &BTreeMap<String, Bucket>) -> Self {
        let entries = entries
            .iter()
            .filter_map(|(color, bucket)| normalize_color(color).map(|c| (c, *bucket)))
            .collect();
        Self { entries }
    }

    /// Fill gaps from learned hints. Existing entries always win.
    #[must_use]
    pub fn with_hints(mut self, hints: &BTreeMap<String, Bucket>) -> Self {
        for (color, bucket) in hints {
            if let Some(color) = normalize_color(color) {
                self.entries.entry(color).or_insert(*bucket);
            }
        }
        self
    }

    #[must_use]
    pub fn get(&self, color: &str) -> Option<Bucket> {
        normalize_color(color).and_then(|c| self.entries.get(&c).copied())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Which signal decided a record's bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Basis {
    Timestamp,
    Color,
    /// Neither signal was usable; the record lands in `other`.
    Unresolved,
}

/// Full classification outcome for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub bucket: Bucket,
    pub basis: Basis,
    /// Whole minutes since the reported time, when known.
    pub age_minutes: Option<i64>,
    /// Bucket implied by the row color, when the color is mapped.
    pub color_bucket: Option<Bucket>,
}

impl Classification {
    /// Timestamp and mapped color disagree.
    #[must_use]
    pub fn is_mismatch(&self) -> bool {
        self.basis == Basis::Timestamp
            && self.color_bucket.is_some_and(|color| color != self.bucket)
    }

    /// Needs capture for color-map tuning.
    #[must_use]
    pub fn is_ambiguous(&self) -> bool {
        self.basis == Basis::Unresolved
    }
}

/// Classify a record against `now`.
#[must_use]
pub fn classify(record: &StudyRecord, now: DateTime<Utc>, color_map: &ColorMap) -> Classification {
    let color_bucket = record.color.as_deref().and_then(|c| color_map.get(c));

    if let Some(reported) = record.reported_at {
        let elapsed = now.signed_duration_since(reported);
        let minutes = elapsed.num_milliseconds() as f64 / 60_000.0;
        return Classification {
            bucket: Bucket::from_elapsed_minutes(minutes),
            basis: Basis::Timestamp,
            age_minutes: Some(elapsed.num_minutes()),
            color_bucket,
        };
    }

    match color_bucket {
        Some(bucket) => Classification {
            bucket,
            basis: Basis::Color,
            age_minutes: None,
            color_bucket,
        },
        None => Classification {
            bucket: Bucket::Other,
            basis: Basis::Unresolved,
            age_minutes: None,
            color_bucket: None,
        },
    }
}

/// Count of CT/MR studies per bucket for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCounts {
    #[serde(rename = "60")]
    pub within_60: usize,
    #[serde(rename = "90")]
    pub within_90: usize,
    #[serde(rename = "120")]
    pub within_120: usize,
    pub other: usize,
}

impl BucketCounts {
    pub fn add(&mut self, bucket: Bucket) {
        match bucket {
            Bucket::Within60 => self.within_60 += 1,
            Bucket::Within90 => self.within_90 += 1,
            Bucket::Within120 => self.within_120 += 1,
            Bucket::Other => self.other += 1,
        }
    }

    #[must_use]
    pub const fn get(&self, bucket: Bucket) -> usize {
        match bucket {
            Bucket::Within60 => self.within_60,
            Bucket::Within90 => self.within_90,
            Bucket::Within120 => self.within_120,
            Bucket::Other => self.other,
        }
    }

    /// Sum of the ≤60, ≤90 and ≤120 buckets.
    #[must_use]
    pub const fn qualifying_total(&self) -> usize {
        self.within_60 + self.within_90 + self.within_120
    }
}

/// A record paired with how it was classified.
#[derive(Debug, Clone)]
pub struct ClassifiedStudy {
    pub record: StudyRecord,
    pub classification: Classification,
}

/// Cycle-level classification result.
#[derive(Debug, Clone, Default)]
pub struct Tally {
    pub counts: BucketCounts,
    pub studies: Vec<ClassifiedStudy>,
}

impl Tally {
    #[must_use]
    pub fn ambiguous(&self) -> usize {
        self.studies
            .iter()
            .filter(|s| s.classification.is_ambiguous())
            .count()
    }

    #[must_use]
    pub fn mismatches(&self) -> usize {
        self.studies
            .iter()
            .filter(|s| s.classification.is_mismatch())
            .count()
    }

    /// Color to timestamp-derived bucket, for rows carrying both signals.
    ///
    /// Colors observed with conflicting buckets in the same cycle are left out.
    #[must_use]
    pub fn observed_color_buckets(&self) -> BTreeMap<String, Bucket> {
        let mut seen: BTreeMap<String, Option<Bucket>> = BTreeMap::new();
        for study in &self.studies {
            if study.classification.basis != Basis::Timestamp {
                continue;
            }
            let Some(color) = study.record.color.as_deref().and_then(normalize_color) else {
                continue;
            };
            let bucket = study.classification.bucket;
            seen.entry(color)
                .and_modify(|existing| {
                    if *existing != Some(bucket) {
                        *existing = None;
                    }
                })
                .or_insert(Some(bucket));
        }
        seen.into_iter()
            .filter_map(|(color, bucket)| bucket.map(|b| (color, b)))
            .collect()
    }
}

/// Classify every record and count the CT/MR ones.
///
/// Pure over its inputs: the same records, map and `now` give the same tally.
#[must_use]
pub fn tally(records: &[StudyRecord], now: DateTime<Utc>, color_map: &ColorMap) -> Tally {
    let mut result = Tally::default();

    for record in records {
        let classification = classify(record, now, color_map);

        if classification.is_ambiguous() {
            tracing::debug!(
                identifier = %record.identifier,
                color = ?record.color,
                "Study has no timestamp and no mapped color"
            );
        } else if classification.is_mismatch() {
            tracing::debug!(
                identifier = %record.identifier,
                color = ?record.color,
                timestamp_bucket = %classification.bucket,
                color_bucket = ?classification.color_bucket,
                "Row color disagrees with timestamp"
            );
        }

        if matches!(record.modality, Modality::Ct | Modality::Mr) {
            result.counts.add(classification.bucket);
        }

        result.studies.push(ClassifiedStudy {
            record: record.clone(),
            classification,
        });
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 16, 23, 0, 0).unwrap()
    }

    fn record(modality: Modality, age_secs: Option<i64>, color: Option<&str>) -> StudyRecord {
        StudyRecord {
            identifier: "DOE^JANE".to_string(),
            modality,
            study: "CT HEAD".to_string(),
            reported_at: age_secs.map(|s| now() - Duration::seconds(s)),
            color: color.map(str::to_string),
        }
    }

    fn map(entries: &[(&str, Bucket)]) -> ColorMap {
        ColorMap::new(
            &entries
                .iter()
                .map(|(c, b)| ((*c).to_string(), *b))
                .collect(),
        )
    }

    #[test]
    fn test_boundary_belongs_to_lower_bucket() {
        assert_eq!(Bucket::from_elapsed_minutes(60.0), Bucket::Within60);
        assert_eq!(Bucket::from_elapsed_minutes(60.01), Bucket::Within90);
        assert_eq!(Bucket::from_elapsed_minutes(90.0), Bucket::Within90);
        assert_eq!(Bucket::from_elapsed_minutes(90.01), Bucket::Within120);
        assert_eq!(Bucket::from_elapsed_minutes(120.0), Bucket::Within120);
        assert_eq!(Bucket::from_elapsed_minutes(120.01), Bucket::Other);
    }

    #[test]
    fn test_non_positive_age_is_within_60() {
        assert_eq!(Bucket::from_elapsed_minutes(0.0), Bucket::Within60);
        assert_eq!(Bucket::from_elapsed_minutes(-5.0), Bucket::Within60);
    }

    #[test]
    fn test_bucket_monotonic_in_elapsed_minutes() {
        let mut previous = Bucket::Within60;
        for tenth in 0..=1200 {
            let bucket = Bucket::from_elapsed_minutes(f64::from(tenth) / 10.0);
            assert!(bucket >= previous, "bucket decreased at {tenth}");
            previous = bucket;
        }
    }

    #[test]
    fn test_classify_exact_sixty_minutes_from_timestamp() {
        let c = classify(&record(Modality::Ct, Some(3600), None), now(), &ColorMap::default());
        assert_eq!(c.bucket, Bucket::Within60);
        assert_eq!(c.basis, Basis::Timestamp);
        assert_eq!(c.age_minutes, Some(60));

        let c = classify(&record(Modality::Ct, Some(3601), None), now(), &ColorMap::default());
        assert_eq!(c.bucket, Bucket::Within90);
    }

    #[test]
    fn test_color_fallback_when_timestamp_missing() {
        let colors = map(&[("#FFC0CB", Bucket::Within120)]);
        let c = classify(&record(Modality::Mr, None, Some("#ffc0cb")), now(), &colors);
        assert_eq!(c.bucket, Bucket::Within120);
        assert_eq!(c.basis, Basis::Color);
    }

    #[test]
    fn test_unresolved_goes_to_other() {
        let colors = map(&[("#ffc0cb", Bucket::Within120)]);
        let c = classify(&record(Modality::Ct, None, Some("#00ff00")), now(), &colors);
        assert_eq!(c.bucket, Bucket::Other);
        assert!(c.is_ambiguous());

        let c = classify(&record(Modality::Ct, None, None), now(), &colors);
        assert!(c.is_ambiguous());
    }

    #[test]
    fn test_timestamp_wins_over_color_and_flags_mismatch() {
        let colors = map(&[("red", Bucket::Within120)]);
        let c = classify(&record(Modality::Ct, Some(30 * 60), Some("Red")), now(), &colors);
        assert_eq!(c.bucket, Bucket::Within60);
        assert!(c.is_mismatch());
    }

    #[test]
    fn test_normalize_color_variants() {
        assert_eq!(normalize_color("#FFF").as_deref(), Some("#ffffff"));
        assert_eq!(normalize_color("rgb(255, 192, 203)").as_deref(), Some("#ffc0cb"));
        assert_eq!(normalize_color("rgba(255,0,0,0.5)").as_deref(), Some("#ff0000"));
        assert_eq!(normalize_color(" Yellow; ").as_deref(), Some("yellow"));
        assert_eq!(normalize_color("transparent"), None);
        assert_eq!(normalize_color(""), None);
    }

    #[test]
    fn test_hints_do_not_override_configured_colors() {
        let configured = map(&[("#ff0000", Bucket::Within120)]);
        let hints: BTreeMap<String, Bucket> = [
            ("#ff0000".to_string(), Bucket::Within60),
            ("#ffff00".to_string(), Bucket::Within90),
        ]
        .into_iter()
        .collect();

        let merged = configured.with_hints(&hints);
        assert_eq!(merged.get("#FF0000"), Some(Bucket::Within120));
        assert_eq!(merged.get("#ffff00"), Some(Bucket::Within90));
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_tally_counts_only_ct_and_mr() {
        let records = vec![
            record(Modality::Ct, Some(30 * 60), None),
            record(Modality::Mr, Some(75 * 60), None),
            record(Modality::Other, Some(30 * 60), None),
            record(Modality::Mr, Some(200 * 60), None),
            record(Modality::Ct, None, None),
        ];

        let result = tally(&records, now(), &ColorMap::default());
        assert_eq!(
            result.counts,
            BucketCounts {
                within_60: 1,
                within_90: 1,
                within_120: 0,
                other: 2,
            }
        );
        assert_eq!(result.counts.qualifying_total(), 2);
        assert_eq!(result.ambiguous(), 1);
        assert_eq!(result.studies.len(), 5);
    }

    #[test]
    fn test_tally_is_deterministic() {
        let colors = map(&[("#ffc0cb", Bucket::Within90)]);
        let records = vec![
            record(Modality::Ct, Some(100 * 60), Some("#ffc0cb")),
            record(Modality::Mr, None, Some("#ffc0cb")),
        ];
        let a = tally(&records, now(), &colors);
        let b = tally(&records, now(), &colors);
        assert_eq!(a.counts, b.counts);
        assert_eq!(a.mismatches(), 1);
    }

    #[test]
    fn test_observed_color_buckets_drops_conflicts() {
        let records = vec![
            record(Modality::Ct, Some(30 * 60), Some("#aaa")),
            record(Modality::Ct, Some(40 * 60), Some("#AAAAAA")),
            record(Modality::Ct, Some(30 * 60), Some("#bbb")),
            record(Modality::Ct, Some(100 * 60), Some("#bbb")),
            record(Modality::Ct, None, Some("#ccc")),
        ];
        let observed = tally(&records, now(), &ColorMap::default()).observed_color_buckets();
        assert_eq!(observed.len(), 1);
        assert_eq!(observed.get("#aaaaaa"), Some(&Bucket::Within60));
    }

    #[test]
    fn test_bucket_labels_round_trip_through_parse() {
        for bucket in [Bucket::Within60, Bucket::Within90, Bucket::Within120, Bucket::Other] {
            assert_eq!(Bucket::parse(bucket.label()), Some(bucket));
        }
        assert_eq!(Bucket::parse("≤90"), Some(Bucket::Within90));
        assert_eq!(Bucket::parse("45"), None);
    }
}
