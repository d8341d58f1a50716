//! Worklist page ingestion.
//!
//! Provides fetching (live HTTP or a saved page) and parsing of the study table.

mod fetch;
mod parser;
mod types;

pub use fetch::{extract_login_form, FileSource, HttpSource, LoginForm, PageSource};
pub use parser::{ParsedWorklist, WorklistParser};
pub use types::{FetchedPage, Modality, StudyRecord};
