//! Worklist data types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Imaging modality of a single study.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Ct,
    Mr,
    Other,
}

impl Modality {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ct => "CT",
            Self::Mr => "MR",
            Self::Other => "OTHER",
        }
    }
}

/// One pending study as read from the worklist table.
///
/// A row listing several studies yields one record per study, all sharing
/// the row's identifier, timestamp and color.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyRecord {
    /// Identifier cell text; not guaranteed unique.
    pub identifier: String,
    pub modality: Modality,
    /// Raw study description for this record.
    pub study: String,
    /// When the study was requested, if the cells parsed.
    pub reported_at: Option<DateTime<Utc>>,
    /// Normalized row color, if any styling was present.
    pub color: Option<String>,
}

/// Raw artifacts returned by a page source.
#[derive(Debug, Clone, Default)]
pub struct FetchedPage {
    pub html: String,
    /// Opaque screenshot bytes; stored, never parsed.
    pub screenshot: Option<Vec<u8>>,
    /// Where the page came from (URL or file path).
    pub source: String,
}
