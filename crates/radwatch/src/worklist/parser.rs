//! Worklist table parser.

use std::sync::LazyLock;

use chrono::{NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use super::types::{Modality, StudyRecord};
use crate::classify::normalize_color;
use crate::config::Selectors;
use crate::error::{MonitorError, Result};

static STUDY_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)[;,/]|\band\b").expect("Invalid study split regex"));
static WITH_WITHOUT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bW/(O\b)?").expect("Invalid W/O regex"));
static CT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bCT\b").expect("Invalid CT regex"));
static MR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bMRI?\b").expect("Invalid MR regex"));

/// Records plus row-level stats for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct ParsedWorklist {
    pub records: Vec<StudyRecord>,
    /// Data rows with enough cells to read.
    pub rows_seen: usize,
    /// Rows dropped for too few cells or no study text.
    pub rows_skipped: usize,
    /// Rows whose date/time cells could not be parsed.
    pub timestamp_errors: Vec<String>,
}

/// Parser for the worklist page.
pub struct WorklistParser {
    selectors: Selectors,
    tz: Tz,
    table: Selector,
    row: Selector,
    header: Selector,
    cell: Selector,
}

impl WorklistParser {
    /// Compile the configured selectors.
    pub fn new(selectors: Selectors, tz: Tz) -> Result<Self> {
        let compile = |css: &str| {
            Selector::parse(css)
                .map_err(|e| MonitorError::Config(format!("invalid selector `{css}`: {e}")))
        };

        Ok(Self {
            table: compile(&selectors.table)?,
            row: compile(&selectors.row)?,
            header: compile("th")?,
            cell: compile("td")?,
            selectors,
            tz,
        })
    }

    /// Parse study records from HTML content.
    ///
    /// Fails only when no table matches; a matching table with no data rows
    /// is a valid empty worklist.
    pub fn parse(&self, html: &str) -> Result<ParsedWorklist> {
        let document = Html::parse_document(html);

        let table = document
            .select(&self.table)
            .find(|t| self.is_worklist_table(t))
            .ok_or_else(|| {
                MonitorError::Parse(format!(
                    "no `{}` with header `{}`",
                    self.selectors.table, self.selectors.required_header
                ))
            })?;

        let mut parsed = ParsedWorklist::default();
        let cols = &self.selectors.columns;

        for (index, row) in table.select(&self.row).enumerate() {
            if row.select(&self.header).next().is_some() {
                continue;
            }
            let cells: Vec<ElementRef<'_>> = row.select(&self.cell).collect();
            if cells.len() < self.selectors.min_cells {
                if !cells.is_empty() {
                    parsed.rows_skipped += 1;
                }
                continue;
            }
            parsed.rows_seen += 1;

            let study_cell = cell_text(&cells, cols.study);
            let studies = split_studies(&study_cell);
            if studies.is_empty() {
                tracing::debug!(row = index, "Row has no study text, skipping");
                parsed.rows_skipped += 1;
                continue;
            }

            let identifier = Some(cell_text(&cells, cols.identifier))
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| format!("row-{index}"));

            let date = cell_text(&cells, cols.date);
            let time = cell_text(&cells, cols.time);
            let reported_at = self.parse_timestamp(&date, &time);
            if reported_at.is_none() {
                parsed
                    .timestamp_errors
                    .push(format!("row {index}: unparseable timestamp '{date} {time}'"));
            }

            let color = row_color(row).or_else(|| cells.first().and_then(|c| row_color(*c)));

            for (modality, study) in studies {
                parsed.records.push(StudyRecord {
                    identifier: identifier.clone(),
                    modality,
                    study,
                    reported_at,
                    color: color.clone(),
                });
            }
        }

        tracing::info!(
            rows = parsed.rows_seen,
            records = parsed.records.len(),
            skipped = parsed.rows_skipped,
            "Parsed worklist"
        );
        Ok(parsed)
    }

    fn is_worklist_table(&self, table: &ElementRef<'_>) -> bool {
        let headers = table
            .select(&self.header)
            .map(|th| th.text().collect::<Vec<_>>().join(" "))
            .collect::<Vec<_>>()
            .join(" ");

        let required = &self.selectors.required_header;
        let excluded = &self.selectors.excluded_header;

        if required.is_empty() {
            return excluded.is_empty() || !headers.contains(excluded.as_str());
        }
        headers.contains(required.as_str())
            && (excluded.is_empty() || !headers.contains(excluded.as_str()))
    }

    /// Interpret the date/time cells as local time in the configured zone.
    ///
    /// Ambiguous times (DST fall-back) take the earlier instant; times in
    /// the spring-forward gap do not exist and yield `None`.
    fn parse_timestamp(&self, date: &str, time: &str) -> Option<chrono::DateTime<Utc>> {
        let combined = if self.selectors.columns.date == self.selectors.columns.time {
            date.to_string()
        } else {
            format!("{date} {time}")
        };
        let naive =
            NaiveDateTime::parse_from_str(combined.trim(), &self.selectors.timestamp_format)
                .ok()?;
        self.tz
            .from_local_datetime(&naive)
            .earliest()
            .map(|t| t.with_timezone(&Utc))
    }
}

fn cell_text(cells: &[ElementRef<'_>], index: usize) -> String {
    cells
        .get(index)
        .map(|c| {
            c.text()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

/// Split a study cell into individual studies with their modality.
///
/// `W/O` and `W/` (with/without contrast) are folded first so the slash
/// separator does not cut a study in half.
fn split_studies(cell: &str) -> Vec<(Modality, String)> {
    let folded = WITH_WITHOUT.replace_all(cell, "W$1");
    STUDY_SPLIT
        .split(&folded)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|part| {
            let upper = part.to_uppercase();
            let modality = if CT.is_match(&upper) {
                Modality::Ct
            } else if MR.is_match(&upper) {
                Modality::Mr
            } else {
                Modality::Other
            };
            (modality, part.to_string())
        })
        .collect()
}

/// Background color from `bgcolor` or an inline `style`.
fn row_color(el: ElementRef<'_>) -> Option<String> {
    if let Some(color) = el.value().attr("bgcolor").and_then(normalize_color) {
        return Some(color);
    }

    let style = el.value().attr("style")?;
    let mut fallback = None;
    for decl in style.split(';') {
        let Some((key, value)) = decl.split_once(':') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "background-color" => return normalize_color(value),
            "background" => fallback = first_color_token(value),
            _ => {}
        }
    }
    fallback
}

fn first_color_token(value: &str) -> Option<String> {
    let value = value.trim();
    let lower = value.to_ascii_lowercase();
    if lower.starts_with("rgb") {
        let end = value.find(')')?;
        return normalize_color(&value[..=end]);
    }
    value.split_whitespace().next().and_then(normalize_color)
}
