//! Error types for the notification system.

use thiserror::Error;

/// Errors that can occur when sending notifications.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// HTTP client could not be built or a request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Channel is not configured
    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    /// Rate limited by the service
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The send did not finish within the channel timeout
    #[error("Timed out after {0}s")]
    Timeout(u64),

    /// The provider accepted the request but no recipient was delivered
    #[error("Rejected: {0}")]
    Rejected(String),

    /// SMTP transport or message construction failed
    #[error("SMTP error: {0}")]
    Smtp(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}
