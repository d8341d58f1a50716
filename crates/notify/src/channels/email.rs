//! Email-to-SMS channel: plain-text mail to carrier gateway addresses over SMTP.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info, warn};

use crate::channels::{Delivery, NotifyChannel};
use crate::error::ChannelError;
use crate::message::AlertMessage;

/// Default SMTP port (STARTTLS).
pub const DEFAULT_SMTP_PORT: u16 = 587;

/// SMTP relay settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Sender address; falls back to `username` when blank.
    pub from_address: String,
    /// Connection/command timeout handed to lettre.
    pub timeout: Duration,
}

impl SmtpConfig {
    /// The address mail is sent from.
    #[must_use]
    pub fn sender(&self) -> &str {
        if self.from_address.trim().is_empty() {
            &self.username
        } else {
            &self.from_address
        }
    }

    fn is_complete(&self) -> bool {
        !self.host.trim().is_empty()
            && !self.username.trim().is_empty()
            && !self.password.is_empty()
    }
}

/// Sends the alert as a short plain-text email to each gateway address.
pub struct EmailSmsChannel {
    config: Option<SmtpConfig>,
    recipients: Vec<String>,
}

impl EmailSmsChannel {
    #[must_use]
    pub fn new(config: Option<SmtpConfig>, recipients: Vec<String>) -> Self {
        let config = config.filter(SmtpConfig::is_complete);
        if config.is_none() {
            debug!("Email-to-SMS notifications disabled (SMTP settings incomplete)");
        }
        Self { config, recipients }
    }

    /// Build the message for one gateway address.
    ///
    /// Gateways render the subject and body as one SMS, so both stay short.
    pub fn build_message(
        from: &str,
        to: &str,
        message: &AlertMessage,
    ) -> Result<Message, ChannelError> {
        let from: Mailbox = from
            .parse()
            .map_err(|e| ChannelError::Smtp(format!("invalid from address {from}: {e}")))?;
        let to: Mailbox = to
            .parse()
            .map_err(|e| ChannelError::Smtp(format!("invalid gateway address {to}: {e}")))?;

        Message::builder()
            .from(from)
            .to(to)
            .subject(message.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone())
            .map_err(|e| ChannelError::Smtp(format!("failed to build message: {e}")))
    }

    fn transport(config: &SmtpConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>, ChannelError> {
        let creds = Credentials::new(config.username.clone(), config.password.clone());

        Ok(
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| ChannelError::Smtp(format!("failed to create transport: {e}")))?
                .port(config.port)
                .credentials(creds)
                .timeout(Some(config.timeout))
                .build(),
        )
    }
}

#[async_trait]
impl NotifyChannel for EmailSmsChannel {
    fn name(&self) -> &'static str {
        "email_sms"
    }

    fn enabled(&self) -> bool {
        self.config.is_some() && !self.recipients.is_empty()
    }

    async fn send(&self, message: &AlertMessage) -> Result<Delivery, ChannelError> {
        let config = self.config.as_ref().ok_or_else(|| {
            ChannelError::NotConfigured("SMTP_HOST / SMTP_USERNAME / SMTP_PASSWORD".to_string())
        })?;

        let mailer = Self::transport(config)?;
        let mut delivery = Delivery::default();

        for to in &self.recipients {
            let email = match Self::build_message(config.sender(), to, message) {
                Ok(email) => email,
                Err(e) => {
                    warn!(channel = "email_sms", to = %to, error = %e, "Skipping recipient");
                    delivery.record_failed(to, e.to_string());
                    continue;
                }
            };

            match mailer.send(email).await {
                Ok(_) => {
                    info!(channel = "email_sms", to = %to, "Gateway email sent");
                    delivery.record_sent(to);
                }
                Err(e) => {
                    warn!(channel = "email_sms", to = %to, error = %e, "SMTP send failed");
                    delivery.record_failed(to, e.to_string());
                }
            }
        }

        delivery.into_result(None)
    }
}
