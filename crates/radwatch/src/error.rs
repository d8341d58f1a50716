//! Error taxonomy for a monitoring cycle.

use thiserror::Error;

/// Errors surfaced by the pipeline.
///
/// `Fetch` and `Parse` abort the cycle before any notification; the rest are
/// recorded in the status artifact while the cycle runs to completion.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Could not reach or log in to the worklist page
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// The worklist table is missing from the page entirely
    #[error("worklist table not found: {0}")]
    Parse(String),

    /// Every notification channel failed
    #[error("all notification channels failed: {0}")]
    Notification(String),

    /// Run state could not be loaded, saved, or locked
    #[error("run state error: {0}")]
    State(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MonitorError {
    /// Whether this error ends the cycle before classification.
    #[must_use]
    pub const fn is_cycle_fatal(&self) -> bool {
        matches!(self, Self::Fetch(_) | Self::Parse(_))
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
