//! Telegram Bot API channel.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::channels::{Delivery, NotifyChannel};
use crate::error::ChannelError;
use crate::message::AlertMessage;

/// Default Telegram Bot API base URL.
pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Bot credentials and destination chats.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_ids: Vec<i64>,
    pub api_base: String,
}

/// Parse a chat id list such as `"-100123, 456;789"`.
///
/// Invalid tokens are skipped and logged.
#[must_use]
pub fn parse_chat_ids(raw: &str) -> Vec<i64> {
    raw.split([',', ';'])
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter_map(|p| match p.parse::<i64>() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(token = p, "Skipping invalid Telegram chat id");
                None
            }
        })
        .collect()
}

/// Telegram channel posting to every configured chat.
pub struct TelegramChannel {
    config: Option<TelegramConfig>,
    client: reqwest::Client,
}

impl TelegramChannel {
    /// `request_timeout` bounds each `sendMessage` call.
    pub fn new(
        config: Option<TelegramConfig>,
        request_timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let config = config.filter(|c| !c.bot_token.trim().is_empty() && !c.chat_ids.is_empty());
        if config.is_none() {
            debug!("Telegram notifications disabled (no bot token or chat ids)");
        }
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl NotifyChannel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    fn enabled(&self) -> bool {
        self.config.is_some()
    }

    async fn send(&self, message: &AlertMessage) -> Result<Delivery, ChannelError> {
        let config = self.config.as_ref().ok_or_else(|| {
            ChannelError::NotConfigured("TELEGRAM_BOT_TOKEN / TELEGRAM_CHAT_IDS".to_string())
        })?;

        let url = format!(
            "{}/bot{}/sendMessage",
            config.api_base.trim_end_matches('/'),
            config.bot_token
        );
        let text = message.text();
        let mut delivery = Delivery::default();

        for chat_id in &config.chat_ids {
            let payload = SendMessage {
                chat_id: *chat_id,
                text: &text,
                disable_notification: false,
            };

            let result = match self.client.post(&url).json(&payload).send().await {
                Ok(response) => {
                    let status = response.status();
                    match response.json::<TelegramResponse>().await {
                        Ok(body) if status.is_success() && body.ok => Ok(()),
                        Ok(body) => Err(format!(
                            "{status}: {}",
                            body.description.unwrap_or_default()
                        )),
                        Err(e) => Err(format!("{status}: {e}")),
                    }
                }
                Err(e) => Err(e.to_string()),
            };

            match result {
                Ok(()) => {
                    info!(channel = "telegram", chat_id, "Telegram message sent");
                    delivery.record_sent(chat_id.to_string());
                }
                Err(reason) => {
                    warn!(channel = "telegram", chat_id, reason = %reason, "Telegram send failed");
                    delivery.record_failed(chat_id.to_string(), reason);
                }
            }
        }

        delivery.into_result(None)
    }
}

// =============================================================================
// Telegram API types
// =============================================================================

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    disable_notification: bool,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Severity;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn telegram(config: TelegramConfig) -> TelegramChannel {
        TelegramChannel::new(Some(config), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_parse_chat_ids_skips_invalid() {
        assert_eq!(parse_chat_ids("-100123, 456;abc; ,789"), vec![-100_123, 456, 789]);
        assert!(parse_chat_ids("").is_empty());
    }

    #[test]
    fn test_missing_token_disables_channel() {
        let channel = telegram(TelegramConfig {
            bot_token: String::new(),
            chat_ids: vec![1],
            api_base: DEFAULT_TELEGRAM_API_BASE.to_string(),
        });
        assert!(!channel.enabled());
    }

    #[tokio::test]
    async fn test_send_to_each_chat() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(2)
            .mount(&server)
            .await;

        let channel = telegram(TelegramConfig {
            bot_token: "TOKEN".to_string(),
            chat_ids: vec![11, -22],
            api_base: server.uri(),
        });
        let msg = AlertMessage::new(Severity::Critical, "backlog", "total=25");

        let delivery = channel.send(&msg).await.unwrap();
        assert_eq!(delivery.sent, vec!["11", "-22"]);
    }

    #[tokio::test]
    async fn test_api_error_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "ok": false,
                "description": "Forbidden: bot was blocked by the user"
            })))
            .mount(&server)
            .await;

        let channel = telegram(TelegramConfig {
            bot_token: "TOKEN".to_string(),
            chat_ids: vec![11],
            api_base: server.uri(),
        });
        let msg = AlertMessage::new(Severity::Critical, "backlog", "");

        let err = channel.send(&msg).await.unwrap_err();
        assert!(err.to_string().contains("blocked"));
    }
}
