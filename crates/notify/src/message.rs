//! Alert payload shared by every channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum body length accepted by Twilio for a single message.
pub const SMS_MAX_CHARS: usize = 1600;

/// Severity levels for alerts and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - test messages, forced sends
    Info,
    /// Warning - something needs attention
    Warning,
    /// Critical - immediate action required
    Critical,
}

/// A rendered alert ready to hand to a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertMessage {
    pub severity: Severity,
    /// Short headline; becomes the email subject.
    pub subject: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl AlertMessage {
    #[must_use]
    pub fn new(severity: Severity, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            severity,
            subject: subject.into(),
            body: body.into(),
            timestamp: Utc::now(),
        }
    }

    /// Set an explicit timestamp (the cycle time rather than construction time).
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Single-text rendering used by SMS and chat channels.
    ///
    /// Truncated on a character boundary to [`SMS_MAX_CHARS`].
    #[must_use]
    pub fn text(&self) -> String {
        let full = if self.body.is_empty() {
            self.subject.clone()
        } else {
            format!("{}\n{}", self.subject, self.body)
        };

        if full.chars().count() <= SMS_MAX_CHARS {
            full
        } else {
            full.chars().take(SMS_MAX_CHARS).collect()
        }
    }
}
