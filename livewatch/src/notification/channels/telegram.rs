//! Telegram Bot API sink.
//!
//! Sends `sendMessage`, or `sendPhoto` when the row carries an image.
//! Handles 429 rate limits by respecting the `parameters.retry_after` field
//! returned in the JSON response body.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{DeliveryOutcome, NotificationSink, render_text};
use crate::Result;
use crate::database::models::NotificationQueueDbModel;

/// Maximum number of retries for rate-limited requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Telegram `sendMessage` text limit (UTF-8 characters).
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Telegram `sendPhoto` caption limit.
const TELEGRAM_CAPTION_LIMIT: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    /// Telegram Bot API token.
    pub bot_token: String,
    /// Queue endpoint served by this bot.
    pub endpoint: String,
    pub api_base: String,
    pub request_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            endpoint: "telegram".to_string(),
            api_base: "https://api.telegram.org".to_string(),
            request_timeout_secs: 15,
        }
    }
}

impl TelegramConfig {
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.bot_token.is_empty()
    }
}

pub struct TelegramSink {
    config: TelegramConfig,
    client: Client,
}

/// Response classification before the retry decision.
enum Attempt {
    Done(DeliveryOutcome),
    RateLimited(Option<Duration>),
}

impl TelegramSink {
    pub fn new(config: TelegramConfig) -> Result<Self> {
        crate::utils::http_client::install_rustls_provider();
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| crate::Error::config(format!("failed to build Telegram client: {e}")))?;
        Ok(Self { config, client })
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            method
        )
    }

    fn build_request(&self, notification: &NotificationQueueDbModel) -> (String, serde_json::Value) {
        let text = render_text(notification);
        match &notification.image_url {
            Some(photo) => (
                self.method_url("sendPhoto"),
                json!({
                    "chat_id": notification.chat_id,
                    "photo": photo,
                    "caption": truncate_message(&text, TELEGRAM_CAPTION_LIMIT),
                    "disable_notification": !notification.sound,
                }),
            ),
            None => (
                self.method_url("sendMessage"),
                json!({
                    "chat_id": notification.chat_id,
                    "text": truncate_message(&text, TELEGRAM_MESSAGE_LIMIT),
                    "disable_notification": !notification.sound,
                }),
            ),
        }
    }

    async fn attempt(&self, url: &str, payload: &serde_json::Value) -> Attempt {
        let response = match self.client.post(url).json(payload).send().await {
            Ok(response) => response,
            Err(e) => {
                return Attempt::Done(DeliveryOutcome::Failed(format!(
                    "Telegram request failed: {e}"
                )));
            }
        };

        let status = response.status();
        if status.is_success() {
            return Attempt::Done(DeliveryOutcome::Delivered);
        }

        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let description = body
            .get("description")
            .and_then(|d| d.as_str())
            .unwrap_or_default()
            .to_string();

        match status.as_u16() {
            429 => Attempt::RateLimited(
                body.get("parameters")
                    .and_then(|p| p.get("retry_after"))
                    .and_then(|v| v.as_u64())
                    .map(Duration::from_secs),
            ),
            403 => Attempt::Done(DeliveryOutcome::Blocked),
            400 if is_gone_chat(&description) => Attempt::Done(DeliveryOutcome::Blocked),
            _ => {
                warn!("Telegram request failed: {} - {}", status, description);
                Attempt::Done(DeliveryOutcome::Failed(format!(
                    "Telegram request failed: {status} - {description}"
                )))
            }
        }
    }
}

fn is_gone_chat(description: &str) -> bool {
    let description = description.to_ascii_lowercase();
    description.contains("chat not found") || description.contains("user is deactivated")
}

#[async_trait]
impl NotificationSink for TelegramSink {
    fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    async fn deliver(&self, notification: &NotificationQueueDbModel) -> DeliveryOutcome {
        let (url, payload) = self.build_request(notification);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.attempt(&url, &payload).await {
                Attempt::Done(outcome) => {
                    debug!(chat_id = notification.chat_id, ?outcome, "Telegram delivery attempted");
                    return outcome;
                }
                Attempt::RateLimited(retry_after) => {
                    if attempts >= MAX_RATE_LIMIT_RETRIES {
                        warn!(
                            "Telegram rate limit: max retries ({}) exceeded, last retry_after was {:?}",
                            MAX_RATE_LIMIT_RETRIES, retry_after
                        );
                        return DeliveryOutcome::Failed(format!(
                            "Telegram rate limit exceeded after {MAX_RATE_LIMIT_RETRIES} retries"
                        ));
                    }
                    let wait_duration = retry_after.unwrap_or(Duration::from_secs(1));
                    debug!(
                        "Telegram rate limited (429), waiting {:?} before retry (attempt {}/{})",
                        wait_duration, attempts, MAX_RATE_LIMIT_RETRIES
                    );
                    tokio::time::sleep(wait_duration).await;
                }
            }
        }
    }
}

/// Truncate a message to fit within a Telegram character limit.
fn truncate_message(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let suffix = "...";
    let budget = limit - suffix.len();
    let truncated: String = text.chars().take(budget).collect();
    format!("{truncated}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NotificationKind;
    use crate::notification::channels::tests::row;
    use crate::sites::test_server::spawn_stub_server;

    fn sink(api_base: String) -> TelegramSink {
        TelegramSink::new(TelegramConfig {
            enabled: true,
            bot_token: "123:ABC".to_string(),
            api_base,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_config_usable() {
        assert!(!TelegramConfig::default().is_usable());
        let config = TelegramConfig {
            enabled: true,
            bot_token: "t".to_string(),
            ..Default::default()
        };
        assert!(config.is_usable());
    }

    #[test]
    fn test_build_request_picks_method() {
        let sink = sink("https://api.example/".to_string());
        let mut notification = row("online", NotificationKind::StatusChange);

        let (url, payload) = sink.build_request(&notification);
        assert_eq!(url, "https://api.example/bot123:ABC/sendMessage");
        assert_eq!(payload["chat_id"], 42);
        assert_eq!(payload["disable_notification"], false);

        notification.image_url = Some("https://img/a.jpg".to_string());
        notification.sound = false;
        let (url, payload) = sink.build_request(&notification);
        assert!(url.ends_with("/sendPhoto"));
        assert_eq!(payload["photo"], "https://img/a.jpg");
        assert_eq!(payload["disable_notification"], true);
    }

    #[tokio::test]
    async fn test_deliver_maps_responses() {
        let ok = spawn_stub_server(vec![("/bot123:ABC/sendMessage", 200, r#"{"ok":true}"#)]).await;
        let blocked = spawn_stub_server(vec![(
            "/bot123:ABC/sendMessage",
            403,
            r#"{"ok":false,"description":"Forbidden: bot was blocked by the user"}"#,
        )])
        .await;
        let gone = spawn_stub_server(vec![(
            "/bot123:ABC/sendMessage",
            400,
            r#"{"ok":false,"description":"Bad Request: chat not found"}"#,
        )])
        .await;
        let limited = spawn_stub_server(vec![(
            "/bot123:ABC/sendMessage",
            429,
            r#"{"ok":false,"parameters":{"retry_after":0}}"#,
        )])
        .await;

        let notification = row("online", NotificationKind::StatusChange);
        assert_eq!(sink(ok).deliver(&notification).await, DeliveryOutcome::Delivered);
        assert_eq!(sink(blocked).deliver(&notification).await, DeliveryOutcome::Blocked);
        assert_eq!(sink(gone).deliver(&notification).await, DeliveryOutcome::Blocked);
        assert!(matches!(
            sink(limited).deliver(&notification).await,
            DeliveryOutcome::Failed(_)
        ));
    }

    #[test]
    fn test_truncate_message() {
        assert_eq!(truncate_message("hello", 100), "hello");

        let long: String = "a".repeat(5000);
        let truncated = truncate_message(&long, TELEGRAM_MESSAGE_LIMIT);
        assert_eq!(truncated.chars().count(), TELEGRAM_MESSAGE_LIMIT);
        assert!(truncated.ends_with("..."));
    }
}
