//! Twilio Programmable Messaging channel.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::channels::{Delivery, NotifyChannel};
use crate::error::ChannelError;
use crate::message::AlertMessage;

/// Default Twilio REST API base URL.
pub const DEFAULT_TWILIO_API_BASE: &str = "https://api.twilio.com";

/// Fallback when Twilio omits `Retry-After` on a 429.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Twilio account credentials.
#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub account_sid: String,
    pub auth_token: String,
    /// Sender number in E.164 form.
    pub from_number: String,
    /// Overridable for tests.
    pub api_base: String,
}

impl SmsConfig {
    /// Build a config, returning `None` when any credential is blank.
    #[must_use]
    pub fn new(account_sid: &str, auth_token: &str, from_number: &str) -> Option<Self> {
        if account_sid.trim().is_empty()
            || auth_token.trim().is_empty()
            || from_number.trim().is_empty()
        {
            return None;
        }
        Some(Self {
            account_sid: account_sid.trim().to_string(),
            auth_token: auth_token.trim().to_string(),
            from_number: from_number.trim().to_string(),
            api_base: DEFAULT_TWILIO_API_BASE.to_string(),
        })
    }

    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base.trim_end_matches('/'),
            self.account_sid
        )
    }
}

/// SMS channel backed by the Twilio Messages API.
pub struct SmsChannel {
    config: Option<SmsConfig>,
    recipients: Vec<String>,
    client: reqwest::Client,
}

impl SmsChannel {
    /// `request_timeout` bounds each Twilio call, so one stuck recipient
    /// cannot hide the ones already sent.
    pub fn new(
        config: Option<SmsConfig>,
        recipients: Vec<String>,
        request_timeout: Duration,
    ) -> Result<Self, ChannelError> {
        if config.is_none() {
            debug!("SMS notifications disabled (Twilio credentials missing)");
        }
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            config,
            recipients,
            client,
        })
    }
}

#[async_trait]
impl NotifyChannel for SmsChannel {
    fn name(&self) -> &'static str {
        "sms"
    }

    fn enabled(&self) -> bool {
        self.config.is_some() && !self.recipients.is_empty()
    }

    async fn send(&self, message: &AlertMessage) -> Result<Delivery, ChannelError> {
        let config = self.config.as_ref().ok_or_else(|| {
            ChannelError::NotConfigured(
                "TWILIO_ACCOUNT_SID / TWILIO_AUTH_TOKEN / TWILIO_FROM_NUMBER".to_string(),
            )
        })?;

        let url = config.messages_url();
        let body = message.text();
        let mut delivery = Delivery::default();
        let mut rate_limited = None;

        for to in &self.recipients {
            debug!(channel = "sms", to = %to, "Sending SMS");

            let response = match self
                .client
                .post(&url)
                .basic_auth(&config.account_sid, Some(&config.auth_token))
                .form(&[
                    ("To", to.as_str()),
                    ("From", config.from_number.as_str()),
                    ("Body", body.as_str()),
                ])
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(channel = "sms", to = %to, error = %e, "Twilio request failed");
                    delivery.record_failed(to, e.to_string());
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                let sid = response
                    .json::<TwilioMessage>()
                    .await
                    .map(|m| m.sid)
                    .unwrap_or_default();
                debug!(channel = "sms", to = %to, sid = %sid, "SMS accepted");
                delivery.record_sent(to);
            } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                warn!(channel = "sms", to = %to, retry_after, "Twilio rate limited");
                rate_limited = Some(retry_after);
                delivery.record_failed(to, format!("rate limited ({retry_after}s)"));
            } else {
                let body = response.text().await.unwrap_or_default();
                let reason = serde_json::from_str::<TwilioError>(&body)
                    .map(|e| format!("{status} code={} {}", e.code.unwrap_or_default(), e.message))
                    .unwrap_or_else(|_| format!("{status}: {body}"));
                warn!(channel = "sms", to = %to, reason = %reason, "Twilio rejected message");
                delivery.record_failed(to, reason);
            }
        }

        delivery.into_result(rate_limited)
    }
}

// =============================================================================
// Twilio API types
// =============================================================================

#[derive(Debug, Deserialize)]
struct TwilioMessage {
    sid: String,
}

#[derive(Debug, Deserialize)]
struct TwilioError {
    #[serde(default)]
    code: Option<u32>,
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Severity;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn config(server: &MockServer) -> SmsConfig {
        SmsConfig::new("AC123", "secret", "+15550000")
            .unwrap()
            .with_api_base(server.uri())
    }

    #[test]
    fn test_blank_credentials_disable_channel() {
        assert!(SmsConfig::new("AC123", "", "+15550000").is_none());
        let channel = SmsChannel::new(None, vec!["+15551111".to_string()], TIMEOUT).unwrap();
        assert!(!channel.enabled());
    }

    #[test]
    fn test_no_recipients_disables_channel() {
        let config = SmsConfig::new("AC123", "secret", "+15550000");
        let channel = SmsChannel::new(config, vec![], TIMEOUT).unwrap();
        assert!(!channel.enabled());
    }

    #[tokio::test]
    async fn test_send_posts_form_to_twilio() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2010-04-01/Accounts/AC123/Messages.json"))
            .and(header_exists("authorization"))
            .and(body_string_contains("From=%2B15550000"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(serde_json::json!({"sid": "SM1"})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let channel = SmsChannel::new(
            Some(config(&server)),
            vec!["+15551111".to_string(), "+15552222".to_string()],
            TIMEOUT,
        )
        .unwrap();
        let msg = AlertMessage::new(Severity::Critical, "backlog", "total=22");

        let delivery = channel.send(&msg).await.unwrap();
        assert_eq!(delivery.sent, vec!["+15551111", "+15552222"]);
        assert!(delivery.failed.is_empty());
    }

    #[tokio::test]
    async fn test_rejection_reports_twilio_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "code": 21211,
                "message": "Invalid 'To' Phone Number"
            })))
            .mount(&server)
            .await;

        let channel =
            SmsChannel::new(Some(config(&server)), vec!["+1".to_string()], TIMEOUT).unwrap();
        let msg = AlertMessage::new(Severity::Critical, "backlog", "");

        let err = channel.send(&msg).await.unwrap_err();
        assert!(err.to_string().contains("21211"));
    }

    #[tokio::test]
    async fn test_rate_limit_maps_to_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "12"))
            .mount(&server)
            .await;

        let channel =
            SmsChannel::new(Some(config(&server)), vec!["+15551111".to_string()], TIMEOUT)
                .unwrap();
        let msg = AlertMessage::new(Severity::Critical, "backlog", "");

        let err = channel.send(&msg).await.unwrap_err();
        assert!(matches!(
            err,
            ChannelError::RateLimited {
                retry_after_secs: 12
            }
        ));
    }

    #[tokio::test]
    async fn test_slow_recipient_times_out_without_losing_the_rest() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("To=%2B15552222"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(serde_json::json!({"sid": "SM2"}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(serde_json::json!({"sid": "SM1"})),
            )
            .mount(&server)
            .await;

        let channel = SmsChannel::new(
            Some(config(&server)),
            vec!["+15551111".to_string(), "+15552222".to_string()],
            Duration::from_millis(300),
        )
        .unwrap();
        let msg = AlertMessage::new(Severity::Critical, "backlog", "total=21");

        let delivery = channel.send(&msg).await.unwrap();
        assert_eq!(delivery.sent, vec!["+15551111"]);
        assert_eq!(delivery.failed.len(), 1);
        assert_eq!(delivery.failed[0].recipient, "+15552222");
    }
}
