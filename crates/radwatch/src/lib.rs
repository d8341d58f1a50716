//! Radiology worklist backlog monitor.
//!
//! This crate provides:
//! - Worklist page fetching (login + cookie session) and table parsing
//! - Elapsed-time bucketing of pending CT/MR studies, with row color fallback
//! - Zone-aware alerting windows and an inclusive threshold
//! - Deduplicated SMS / email-to-SMS / Telegram paging via the `notify` crate
//! - Atomically replaced run state and a status record for the dashboard

pub mod artifacts;
pub mod classify;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod pipeline;
pub mod state;
pub mod threshold;
pub mod window;
pub mod worklist;

// Re-export main types
pub use classify::{Bucket, BucketCounts, ColorMap};
pub use config::MonitorConfig;
pub use dispatch::{DispatchResult, Dispatcher};
pub use error::{MonitorError, Result};
pub use pipeline::{CycleReport, Monitor, RunOptions};
pub use state::{RunState, RunStateStore};
pub use threshold::{AlertDecision, ThresholdEvaluator};
pub use window::WindowPolicy;
pub use worklist::{FetchedPage, PageSource, StudyRecord};
