//! Alert dispatch: dedup policy, message rendering and the fallback chain.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use notify::channels::sms::DEFAULT_TWILIO_API_BASE;
use notify::channels::telegram::DEFAULT_TELEGRAM_API_BASE;
use notify::{
    AlertMessage, EmailSmsChannel, FallbackOutcome, Notifier, NotifyChannel, Severity,
    SmsChannel, SmsConfig, SmtpConfig, TelegramChannel, TelegramConfig,
};
use serde::Serialize;

use crate::config::{MonitorConfig, ResendConfig, ResendPolicy};
use crate::error::{MonitorError, Result};
use crate::state::{AlertAttempt, RunState};
use crate::threshold::AlertDecision;

/// What happened to a cycle's alert.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchResult {
    /// A channel delivered the alert.
    Delivered {
        channel: String,
        outcome: FallbackOutcome,
    },
    /// Every channel failed (or none is configured).
    Failed {
        errors: Vec<String>,
        outcome: FallbackOutcome,
    },
    /// Dedup held the alert back.
    Suppressed { reason: String },
    /// No dispatch this cycle: outside the window, below threshold, or a dry run.
    Skipped { reason: String },
}

impl DispatchResult {
    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    /// Channel that delivered, if any.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::Delivered { channel, .. } => Some(channel),
            _ => None,
        }
    }

    /// Error summary when delivery failed.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        match self {
            Self::Failed { errors, .. } => Some(errors.join("; ")),
            _ => None,
        }
    }
}

/// Build the fallback chain from configuration: Twilio SMS, then
/// email-to-SMS, then Telegram. Channels missing settings stay disabled.
pub fn build_notifier(config: &MonitorConfig) -> Result<Notifier> {
    let settings = &config.notification;
    let channel_error =
        |e: notify::ChannelError| MonitorError::Config(format!("notification channel: {e}"));

    let twilio = &settings.primary;
    let sms_config =
        SmsConfig::new(&twilio.account_sid, &twilio.auth_token, &twilio.from_number).map(|c| {
            c.with_api_base(non_blank_or(&twilio.api_base, DEFAULT_TWILIO_API_BASE))
        });
    let phones = config.phone_numbers();
    let sms_timeout = request_timeout(settings.send_timeout(), phones.len());
    let sms = SmsChannel::new(sms_config, phones, sms_timeout).map_err(channel_error)?;

    let smtp = &settings.secondary;
    let email = EmailSmsChannel::new(
        Some(SmtpConfig {
            host: smtp.host.clone(),
            port: smtp.port,
            username: smtp.username.clone(),
            password: smtp.password.clone(),
            from_address: smtp.from_address.clone(),
            timeout: settings.send_timeout(),
        }),
        config.sms_gateways(),
    );

    let tg = &settings.telegram;
    let telegram = TelegramChannel::new(
        Some(TelegramConfig {
            bot_token: tg.bot_token.clone(),
            chat_ids: tg.chat_ids.clone(),
            api_base: non_blank_or(&tg.api_base, DEFAULT_TELEGRAM_API_BASE),
        }),
        request_timeout(settings.send_timeout(), tg.chat_ids.len()),
    )
    .map_err(channel_error)?;

    let channels: Vec<Arc<dyn NotifyChannel>> =
        vec![Arc::new(sms), Arc::new(email), Arc::new(telegram)];
    Ok(Notifier::with_channels(channels, settings.send_timeout()))
}

/// Share a channel's send budget across its recipients, so every request
/// finishes (or fails) before the whole channel would time out.
fn request_timeout(send_timeout: Duration, recipients: usize) -> Duration {
    let share = send_timeout / u32::try_from(recipients.max(1)).unwrap_or(u32::MAX);
    share.max(Duration::from_secs(1))
}

fn non_blank_or(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.trim().to_string()
    }
}

/// Why a triggered alert should be held back, or `None` to send.
///
/// Only delivered alerts count: `last_alert_at` never moves on a failed
/// attempt.
#[must_use]
pub fn suppression_reason(
    resend: &ResendConfig,
    decision: &AlertDecision,
    state: &RunState,
) -> Option<String> {
    if resend.policy == ResendPolicy::Always {
        return None;
    }
    let last_at = state.last_alert_at?;
    let elapsed = decision.evaluated_at.signed_duration_since(last_at);
    if elapsed >= resend.cooldown() {
        return None;
    }

    let last_total = state.last_alert_total.unwrap_or(0);
    if resend.policy == ResendPolicy::OnIncrease && decision.qualifying_total > last_total {
        return None;
    }

    Some(format!(
        "last alert {} min ago (total {last_total}), cooldown {} min",
        elapsed.num_minutes().max(0),
        resend.cooldown_minutes
    ))
}

/// Render the SMS-sized alert text.
#[must_use]
pub fn render_message(
    decision: &AlertDecision,
    tz: Tz,
    contact_names: &[String],
    forced: bool,
) -> AlertMessage {
    let counts = &decision.breakdown;
    let subject = format!(
        "CT/MR backlog 60/90/120 total={} (>= {} threshold)",
        decision.qualifying_total, decision.threshold
    );
    let mut body = format!(
        "≤60: {} | ≤90: {} | ≤120: {} | other: {}\nAs of {}",
        counts.within_60,
        counts.within_90,
        counts.within_120,
        counts.other,
        local_stamp(decision.evaluated_at, tz),
    );
    if !contact_names.is_empty() {
        body.push_str(&format!("\nNotifying: {}", contact_names.join(", ")));
    }
    if forced {
        body.push_str("\n(forced)");
    }

    let severity = if decision.triggered {
        Severity::Critical
    } else {
        Severity::Warning
    };
    AlertMessage::new(severity, subject, body).at(decision.evaluated_at)
}

fn local_stamp(at: DateTime<Utc>, tz: Tz) -> String {
    at.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z").to_string()
}

/// Sends triggered alerts through the notifier, honoring the resend policy.
pub struct Dispatcher {
    notifier: Notifier,
    resend: ResendConfig,
    tz: Tz,
    contact_names: Vec<String>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(notifier: Notifier, resend: ResendConfig, tz: Tz, contact_names: Vec<String>) -> Self {
        Self {
            notifier,
            resend,
            tz,
            contact_names,
        }
    }

    pub fn from_config(config: &MonitorConfig, tz: Tz) -> Result<Self> {
        Ok(Self::new(
            build_notifier(config)?,
            config.resend.clone(),
            tz,
            config.contact_names(),
        ))
    }

    #[must_use]
    pub fn channel_names(&self) -> Vec<&'static str> {
        self.notifier.channel_names()
    }

    /// Dispatch a decision and record the attempt in `state`.
    ///
    /// `force` skips the dedup check. `state` is only touched once the
    /// fallback run has concluded.
    pub async fn dispatch(
        &self,
        decision: &AlertDecision,
        state: &mut RunState,
        force: bool,
    ) -> DispatchResult {
        if !force {
            if let Some(reason) = suppression_reason(&self.resend, decision, state) {
                tracing::info!(reason = %reason, total = decision.qualifying_total, "Alert suppressed");
                return DispatchResult::Suppressed { reason };
            }
        }

        let message = render_message(decision, self.tz, &self.contact_names, force);
        let outcome = self.notifier.send_with_fallback(&message).await;

        let attempt_at = decision.evaluated_at;
        match outcome.delivered_by.clone() {
            Some(channel) => {
                state.record_attempt(AlertAttempt {
                    at: attempt_at,
                    qualifying_total: decision.qualifying_total,
                    delivered_by: Some(channel.clone()),
                    error: None,
                });
                DispatchResult::Delivered { channel, outcome }
            }
            None => {
                let mut errors = outcome.errors();
                if errors.is_empty() {
                    errors.push("no notification channels configured".to_string());
                }
                tracing::error!(errors = ?errors, "Alert not delivered by any channel");
                state.record_attempt(AlertAttempt {
                    at: attempt_at,
                    qualifying_total: decision.qualifying_total,
                    delivered_by: None,
                    error: Some(errors.join("; ")),
                });
                DispatchResult::Failed { errors, outcome }
            }
        }
    }

    /// Send a one-off test message through the chain. Run state is untouched.
    pub async fn send_test(&self, now: DateTime<Utc>) -> FallbackOutcome {
        let message = AlertMessage::new(
            Severity::Info,
            "radwatch test notification",
            format!("Test sent {}", local_stamp(now, self.tz)),
        )
        .at(now);
        self.notifier.send_with_fallback(&message).await
    }
}
