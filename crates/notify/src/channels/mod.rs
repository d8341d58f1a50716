//! Notification channel implementations.

pub mod email;
pub mod sms;
pub mod telegram;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ChannelError;
use crate::message::AlertMessage;

/// Trait for notification channels (SMS, email gateway, Telegram).
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    /// Get the name of this channel.
    fn name(&self) -> &'static str;

    /// Check if this channel is enabled/configured.
    fn enabled(&self) -> bool;

    /// Send a message to every recipient this channel was built with.
    ///
    /// Returns `Ok` when at least one recipient was delivered; the caller
    /// checks [`Delivery::is_complete`] for the rest.
    async fn send(&self, message: &AlertMessage) -> Result<Delivery, ChannelError>;
}

/// Per-recipient result of a channel send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub sent: Vec<String>,
    pub failed: Vec<RecipientFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecipientFailure {
    pub recipient: String,
    pub reason: String,
}

impl Delivery {
    pub fn record_sent(&mut self, recipient: impl Into<String>) {
        self.sent.push(recipient.into());
    }

    pub fn record_failed(&mut self, recipient: impl Into<String>, reason: impl Into<String>) {
        self.failed.push(RecipientFailure {
            recipient: recipient.into(),
            reason: reason.into(),
        });
    }

    /// Every recipient was reached.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// `recipient: reason` for each failure, joined with `; `.
    #[must_use]
    pub fn failure_summary(&self) -> String {
        self.failed
            .iter()
            .map(|f| format!("{}: {}", f.recipient, f.reason))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Convert into the channel result: success only if something went out.
    pub(crate) fn into_result(self, rate_limited: Option<u64>) -> Result<Self, ChannelError> {
        if !self.sent.is_empty() {
            return Ok(self);
        }
        if let Some(retry_after_secs) = rate_limited {
            return Err(ChannelError::RateLimited { retry_after_secs });
        }
        if self.failed.is_empty() {
            return Err(ChannelError::Rejected("no recipients".to_string()));
        }
        Err(ChannelError::Rejected(self.failure_summary()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_delivery_is_success() {
        let mut delivery = Delivery::default();
        delivery.record_sent("+15550001");
        delivery.record_failed("+15550002", "invalid number");

        let result = delivery.into_result(None).unwrap();
        assert_eq!(result.sent.len(), 1);
        assert!(!result.is_complete());
        assert_eq!(result.failure_summary(), "+15550002: invalid number");
    }

    #[test]
    fn test_no_delivery_is_rejected() {
        let mut delivery = Delivery::default();
        delivery.record_failed("+15550002", "invalid number");

        let err = delivery.into_result(None).unwrap_err();
        assert!(err.to_string().contains("+15550002: invalid number"));
    }

    #[test]
    fn test_rate_limit_reported_when_nothing_sent() {
        let err = Delivery::default().into_result(Some(30)).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::RateLimited {
                retry_after_secs: 30
            }
        ));
    }
}
