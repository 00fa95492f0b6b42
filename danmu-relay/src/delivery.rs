//! Telegram Bot API delivery channel.
//!
//! Sends formatted danmaku via `POST /bot<token>/sendMessage` with HTML
//! parse mode, link previews and notifications disabled. Handles 429 rate
//! limits by respecting the `parameters.retry_after` field in the response
//! body.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

use relay_core::{DeliveryOptions, DeliverySink, DestinationId, RelayError, Result};

/// Maximum number of retries for rate-limited requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Telegram `sendMessage` text limit (UTF-8 characters).
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Telegram delivery configuration.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    /// Bot API token
    pub bot_token: String,
    /// API base URL, normally `https://api.telegram.org`
    pub api_base: String,
}

/// Delivery boundary backed by the Telegram Bot API.
pub struct TelegramDelivery {
    config: TelegramConfig,
    client: Client,
}

impl TelegramDelivery {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    fn send_url(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token
        )
    }

    /// Send a request, retrying a bounded number of times on 429.
    async fn send_with_retry(&self, payload: &serde_json::Value) -> Result<String> {
        let url = self.send_url();
        let mut attempts = 0;

        loop {
            attempts += 1;

            let response = self
                .client
                .post(&url)
                .json(payload)
                .send()
                .await
                .map_err(|e| RelayError::delivery(format!("sendMessage request failed: {e}")))?;

            let status = response.status();

            if status.is_success() {
                let body: serde_json::Value = response.json().await.unwrap_or_default();
                let message_id = body
                    .get("result")
                    .and_then(|r| r.get("message_id"))
                    .and_then(|v| v.as_i64())
                    .map(|id| id.to_string())
                    .unwrap_or_default();
                return Ok(message_id);
            }

            if status.as_u16() == 429 {
                let body: serde_json::Value = response.json().await.unwrap_or_default();
                let retry_after = body
                    .get("parameters")
                    .and_then(|p| p.get("retry_after"))
                    .and_then(|v| v.as_u64())
                    .map(Duration::from_secs);

                if attempts >= MAX_RATE_LIMIT_RETRIES {
                    return Err(RelayError::delivery(format!(
                        "sendMessage rate limit exceeded after {MAX_RATE_LIMIT_RETRIES} retries"
                    )));
                }

                let wait = retry_after.unwrap_or(Duration::from_secs(1));
                debug!(
                    "sendMessage rate limited (429), waiting {:?} before retry (attempt {}/{})",
                    wait, attempts, MAX_RATE_LIMIT_RETRIES
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            warn!("sendMessage failed: {status} - {body}");
            return Err(RelayError::delivery(format!(
                "sendMessage failed: {status} - {body}"
            )));
        }
    }
}

#[async_trait]
impl DeliverySink for TelegramDelivery {
    async fn deliver(
        &self,
        destination: DestinationId,
        text: &str,
        _options: &DeliveryOptions,
    ) -> Result<String> {
        let payload = json!({
            "chat_id": destination,
            "text": truncate_message(text, TELEGRAM_MESSAGE_LIMIT),
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
            "disable_notification": true,
        });
        self.send_with_retry(&payload).await
    }
}

/// Truncate a message to fit within the Telegram character limit.
fn truncate_message(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let suffix = "…";
    let budget = limit - suffix.chars().count();
    let truncated: String = text.chars().take(budget).collect();
    format!("{truncated}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_url() {
        let delivery = TelegramDelivery::new(TelegramConfig {
            bot_token: "123:ABC".to_string(),
            api_base: "https://api.telegram.org/".to_string(),
        });
        assert_eq!(
            delivery.send_url(),
            "https://api.telegram.org/bot123:ABC/sendMessage"
        );
    }

    #[test]
    fn test_truncate_message() {
        assert_eq!(truncate_message("hello", 100), "hello");

        let long: String = "好".repeat(5000);
        let truncated = truncate_message(&long, TELEGRAM_MESSAGE_LIMIT);
        assert_eq!(truncated.chars().count(), TELEGRAM_MESSAGE_LIMIT);
        assert!(truncated.ends_with('…'));
    }
}
