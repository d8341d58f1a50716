//! Alert delivery for radwatch.
//!
//! This crate provides an ordered-fallback notification chain: a message is
//! offered to each enabled channel in turn until one of them reaches every
//! recipient it was built with.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use notify::{AlertMessage, Notifier, Severity, SmsChannel, SmsConfig};
//!
//! # async fn run() {
//! let sms = SmsChannel::new(
//!     SmsConfig::new("AC...", "token", "+15550000"),
//!     vec!["+15551111".to_string()],
//!     Duration::from_secs(10),
//! )
//! .unwrap();
//! let notifier = Notifier::with_channels(vec![Arc::new(sms)], Duration::from_secs(20));
//!
//! let outcome = notifier
//!     .send_with_fallback(&AlertMessage::new(Severity::Critical, "backlog", "total=21"))
//!     .await;
//! assert!(outcome.delivered_by.is_some());
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`NotifyChannel`] trait defines the interface for notification channels
//! - [`SmsChannel`] sends through the Twilio Messages API
//! - [`EmailSmsChannel`] mails carrier email-to-SMS gateways over SMTP
//! - [`TelegramChannel`] posts to Telegram chats
//! - [`Notifier`] walks the channels in order with a per-send timeout

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod message;

pub use channels::email::{EmailSmsChannel, SmtpConfig};
pub use channels::sms::{SmsChannel, SmsConfig};
pub use channels::telegram::{parse_chat_ids, TelegramChannel, TelegramConfig};
pub use channels::{Delivery, NotifyChannel, RecipientFailure};
pub use error::ChannelError;
pub use message::{AlertMessage, Severity};

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

/// One channel's try within a fallback run.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelAttempt {
    pub channel: String,
    /// Every recipient was reached.
    pub delivered: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sent: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<RecipientFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of [`Notifier::send_with_fallback`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct FallbackOutcome {
    /// Name of the channel that delivered, if any did.
    pub delivered_by: Option<String>,
    pub attempts: Vec<ChannelAttempt>,
}

impl FallbackOutcome {
    #[must_use]
    pub fn delivered(&self) -> bool {
        self.delivered_by.is_some()
    }

    /// Errors from every failed attempt, prefixed with the channel name.
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.attempts
            .iter()
            .filter_map(|a| a.error.as_ref().map(|e| format!("{}: {e}", a.channel)))
            .collect()
    }
}

/// Ordered notification chain.
///
/// Channels are tried first to last; the first one that reaches all of its
/// recipients ends the run. A partial delivery falls through to the next
/// channel, which pages its whole contact list. Each send is bounded by
/// `send_timeout` and a timeout counts as a failure of that channel.
pub struct Notifier {
    channels: Vec<Arc<dyn NotifyChannel>>,
    send_timeout: Duration,
}

impl Notifier {
    /// Create a notifier with specific channels, in fallback order.
    #[must_use]
    pub fn with_channels(channels: Vec<Arc<dyn NotifyChannel>>, send_timeout: Duration) -> Self {
        let enabled: Vec<&str> = channels
            .iter()
            .filter(|c| c.enabled())
            .map(|c| c.name())
            .collect();
        if enabled.is_empty() {
            warn!("No notification channels configured");
        } else {
            info!(channels = ?enabled, "Notification chain initialized");
        }

        Self {
            channels,
            send_timeout,
        }
    }

    /// Check if any notification channels are enabled.
    #[must_use]
    pub fn has_channels(&self) -> bool {
        self.channels.iter().any(|c| c.enabled())
    }

    /// Names of the enabled channels, in fallback order.
    #[must_use]
    pub fn channel_names(&self) -> Vec<&'static str> {
        self.channels
            .iter()
            .filter(|c| c.enabled())
            .map(|c| c.name())
            .collect()
    }

    /// Offer `message` to each enabled channel until one reaches everyone.
    pub async fn send_with_fallback(&self, message: &AlertMessage) -> FallbackOutcome {
        let mut outcome = FallbackOutcome::default();

        for channel in &self.channels {
            let channel_name = channel.name();

            if !channel.enabled() {
                debug!(channel = channel_name, "Channel disabled, skipping");
                continue;
            }

            let result = match tokio::time::timeout(self.send_timeout, channel.send(message)).await
            {
                Ok(result) => result,
                Err(_) => Err(ChannelError::Timeout(self.send_timeout.as_secs())),
            };

            match result {
                Ok(delivery) if !delivery.is_complete() => {
                    let missed = delivery.failure_summary();
                    warn!(
                        channel = channel_name,
                        sent = delivery.sent.len(),
                        failed = delivery.failed.len(),
                        missed = %missed,
                        "Partial delivery, falling back"
                    );
                    outcome.attempts.push(ChannelAttempt {
                        channel: channel_name.to_string(),
                        delivered: false,
                        sent: delivery.sent,
                        failed: delivery.failed,
                        error: Some(format!("partial delivery, missed {missed}")),
                    });
                }
                Ok(delivery) => {
                    info!(
                        channel = channel_name,
                        sent = delivery.sent.len(),
                        "Alert delivered"
                    );
                    outcome.attempts.push(ChannelAttempt {
                        channel: channel_name.to_string(),
                        delivered: true,
                        sent: delivery.sent,
                        failed: delivery.failed,
                        error: None,
                    });
                    outcome.delivered_by = Some(channel_name.to_string());
                    return outcome;
                }
                Err(e) => {
                    error!(
                        channel = channel_name,
                        error = %e,
                        "Channel failed, falling back"
                    );
                    outcome.attempts.push(ChannelAttempt {
                        channel: channel_name.to_string(),
                        delivered: false,
                        sent: vec![],
                        failed: vec![],
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        if outcome.attempts.is_empty() {
            warn!("No enabled channel to deliver alert");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum Mode {
        Deliver,
        Partial,
        Fail,
    }

    struct FakeChannel {
        name: &'static str,
        mode: Mode,
        delay: Option<Duration>,
        calls: AtomicUsize,
    }

    impl FakeChannel {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Self::with_mode(name, if fail { Mode::Fail } else { Mode::Deliver })
        }

        fn with_mode(name: &'static str, mode: Mode) -> Arc<Self> {
            Arc::new(Self {
                name,
                mode,
                delay: None,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl NotifyChannel for FakeChannel {
        fn name(&self) -> &'static str {
            self.name
        }

        fn enabled(&self) -> bool {
            true
        }

        async fn send(&self, _message: &AlertMessage) -> Result<Delivery, ChannelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut d = Delivery::default();
            match self.mode {
                Mode::Fail => return Err(ChannelError::Other("boom".to_string())),
                Mode::Deliver => d.record_sent("+15551111"),
                Mode::Partial => {
                    d.record_sent("+15551111");
                    d.record_failed("+15552222", "unreachable");
                }
            }
            Ok(d)
        }
    }

    fn msg() -> AlertMessage {
        AlertMessage::new(Severity::Critical, "backlog", "total=20")
    }

    #[test]
    fn test_empty_notifier_has_no_channels() {
        let notifier = Notifier::with_channels(vec![], Duration::from_secs(5));
        assert!(!notifier.has_channels());
        assert!(notifier.channel_names().is_empty());
    }

    #[tokio::test]
    async fn test_primary_success_skips_secondary() {
        let primary = FakeChannel::new("sms", false);
        let secondary = FakeChannel::new("email_sms", false);
        let notifier = Notifier::with_channels(
            vec![primary.clone(), secondary.clone()],
            Duration::from_secs(5),
        );

        let outcome = notifier.send_with_fallback(&msg()).await;
        assert_eq!(outcome.delivered_by.as_deref(), Some("sms"));
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_primary_failure_falls_back() {
        let primary = FakeChannel::new("sms", true);
        let secondary = FakeChannel::new("email_sms", false);
        let notifier = Notifier::with_channels(
            vec![primary.clone(), secondary.clone()],
            Duration::from_secs(5),
        );

        let outcome = notifier.send_with_fallback(&msg()).await;
        assert_eq!(outcome.delivered_by.as_deref(), Some("email_sms"));
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.errors(), vec!["sms: boom".to_string()]);
    }

    #[tokio::test]
    async fn test_all_channels_fail() {
        let notifier = Notifier::with_channels(
            vec![FakeChannel::new("sms", true), FakeChannel::new("email_sms", true)],
            Duration::from_secs(5),
        );

        let outcome = notifier.send_with_fallback(&msg()).await;
        assert!(!outcome.delivered());
        assert_eq!(outcome.errors().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let slow = Arc::new(FakeChannel {
            name: "sms",
            mode: Mode::Deliver,
            delay: Some(Duration::from_secs(60)),
            calls: AtomicUsize::new(0),
        });
        let notifier = Notifier::with_channels(
            vec![slow, FakeChannel::new("email_sms", false)],
            Duration::from_secs(1),
        );

        let outcome = notifier.send_with_fallback(&msg()).await;
        assert_eq!(outcome.delivered_by.as_deref(), Some("email_sms"));
        assert!(outcome.errors()[0].contains("Timed out"));
    }

    #[tokio::test]
    async fn test_partial_delivery_falls_back() {
        let primary = FakeChannel::with_mode("sms", Mode::Partial);
        let secondary = FakeChannel::new("email_sms", false);
        let notifier = Notifier::with_channels(
            vec![primary.clone(), secondary.clone()],
            Duration::from_secs(5),
        );

        let outcome = notifier.send_with_fallback(&msg()).await;
        assert_eq!(outcome.delivered_by.as_deref(), Some("email_sms"));
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
        assert!(!outcome.attempts[0].delivered);
        assert_eq!(outcome.attempts[0].sent, vec!["+15551111"]);
        assert_eq!(
            outcome.errors(),
            vec!["sms: partial delivery, missed +15552222: unreachable".to_string()]
        );
    }

    #[tokio::test]
    async fn test_only_partial_deliveries_is_not_delivered() {
        let notifier = Notifier::with_channels(
            vec![
                FakeChannel::with_mode("sms", Mode::Partial),
                FakeChannel::with_mode("email_sms", Mode::Partial),
            ],
            Duration::from_secs(5),
        );

        let outcome = notifier.send_with_fallback(&msg()).await;
        assert!(!outcome.delivered());
        assert_eq!(outcome.attempts.len(), 2);
        assert!(outcome.attempts.iter().all(|a| a.sent.len() == 1));
    }

    #[tokio::test]
    async fn test_rate_limited_sms_recipient_falls_back_to_email() {
        use wiremock::matchers::{body_string_contains, method};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("To=%2B15551111"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(serde_json::json!({"sid": "SM1"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("To=%2B15552222"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "60"))
            .expect(1)
            .mount(&server)
            .await;

        let sms = SmsChannel::new(
            SmsConfig::new("AC123", "secret", "+15550000").map(|c| c.with_api_base(server.uri())),
            vec!["+15551111".to_string(), "+15552222".to_string()],
            Duration::from_secs(5),
        )
        .unwrap();
        let email = FakeChannel::new("email_sms", false);
        let notifier =
            Notifier::with_channels(vec![Arc::new(sms), email.clone()], Duration::from_secs(10));

        let outcome = notifier.send_with_fallback(&msg()).await;

        assert_eq!(outcome.delivered_by.as_deref(), Some("email_sms"));
        assert_eq!(email.calls.load(Ordering::SeqCst), 1);
        let sms_attempt = &outcome.attempts[0];
        assert_eq!(sms_attempt.channel, "sms");
        assert!(!sms_attempt.delivered);
        assert_eq!(sms_attempt.sent, vec!["+15551111"]);
        assert_eq!(sms_attempt.failed[0].recipient, "+15552222");
        assert!(sms_attempt.failed[0].reason.contains("rate limited"));
    }
}
