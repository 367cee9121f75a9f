//! Telegram notifier — delivers nudges through the Bot API.
//!
//! The entity id is the Telegram chat id; content references are resolved
//! to text through the [`ContentCatalog`].

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};

use crate::channels::content::ContentCatalog;
use crate::channels::notifier::Notifier;
use crate::error::ChannelError;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Telegram notifier — one `sendMessage` call per chunk.
pub struct TelegramNotifier {
    bot_token: SecretString,
    catalog: Arc<ContentCatalog>,
    client: reqwest::Client,
    api_base: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: SecretString, catalog: Arc<ContentCatalog>) -> Self {
        Self {
            bot_token,
            catalog,
            client: reqwest::Client::new(),
            api_base: TELEGRAM_API_BASE.to_string(),
        }
    }

    /// Point the notifier at a different Bot API host (local bot server, tests).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    /// Send a text message, trying Markdown first with plain text fallback.
    /// Splits long messages that exceed Telegram's 4096 char limit.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        if text.trim().is_empty() {
            return Err(ChannelError::InvalidMessage(
                "refusing to send empty text".into(),
            ));
        }

        let chunks = split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH);
        for chunk in &chunks {
            self.send_message_chunk(chat_id, chunk).await?;
        }
        Ok(())
    }

    /// Send a single message chunk (≤4096 chars), Markdown-first with fallback.
    async fn send_message_chunk(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        let markdown_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown"
        });

        let markdown_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&markdown_body)
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.without_url().to_string()))?;

        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        if markdown_status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ChannelError::RateLimited {
                name: "telegram".into(),
            });
        }
        tracing::warn!(
            chat_id = %chat_id,
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        // Retry without parse_mode
        let plain_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        let plain_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&plain_body)
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.without_url().to_string()))?;

        let plain_status = plain_resp.status();
        if plain_status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ChannelError::RateLimited {
                name: "telegram".into(),
            });
        }
        if !plain_status.is_success() {
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!(
                    "sendMessage failed (markdown: {}, plain: {} {})",
                    markdown_status, plain_status, plain_err
                ),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, entity_id: &str, content_ref: &str) -> Result<(), ChannelError> {
        if entity_id.parse::<i64>().is_err() {
            return Err(ChannelError::InvalidMessage(format!(
                "entity id {entity_id} is not a Telegram chat id"
            )));
        }
        let text = self.catalog.resolve(content_ref)?;
        self.send_message(entity_id, text).await?;
        tracing::debug!(chat_id = %entity_id, content_ref = %content_ref, "Telegram nudge delivered");
        Ok(())
    }
}

/// Split a message into chunks that fit within Telegram's limit.
///
/// Prefers newline, then space boundaries; never splits inside a UTF-8
/// character.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut limit = max_len;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }

        // Find a good split point
        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(limit);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { limit } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier() -> TelegramNotifier {
        let mut catalog = ContentCatalog::default();
        catalog.insert("intro_nudge_30m", "Hello there");
        TelegramNotifier::new(SecretString::from("123:ABC".to_string()), Arc::new(catalog))
    }

    #[test]
    fn telegram_notifier_name() {
        assert_eq!(notifier().name(), "telegram");
    }

    #[test]
    fn telegram_api_url() {
        assert_eq!(
            notifier().api_url("sendMessage"),
            "https://api.telegram.org/bot123:ABC/sendMessage"
        );
    }

    #[test]
    fn custom_api_base() {
        let n = notifier().with_api_base("http://127.0.0.1:8081/");
        assert_eq!(n.api_url("getMe"), "http://127.0.0.1:8081/bot123:ABC/getMe");
    }

    #[tokio::test]
    async fn unknown_content_fails_before_any_request() {
        let err = notifier().send("99887766", "missing_ref").await.unwrap_err();
        assert!(matches!(err, ChannelError::UnknownContent(_)));
    }

    #[tokio::test]
    async fn non_numeric_entity_is_rejected() {
        let err = notifier().send("alice", "intro_nudge_30m").await.unwrap_err();
        assert!(matches!(err, ChannelError::InvalidMessage(_)));
    }

    // ── Message splitting tests ─────────────────────────────────────

    #[test]
    fn split_message_short() {
        let chunks = split_message("Hello", 4096);
        assert_eq!(chunks, vec!["Hello"]);
    }

    #[test]
    fn split_message_exact_limit() {
        let msg = "a".repeat(4096);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 4096);
    }

    #[test]
    fn split_message_over_limit_on_newline() {
        let msg = format!("{}\n{}", "a".repeat(2000), "b".repeat(3000));
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(2000));
        assert_eq!(chunks[1], "b".repeat(3000));
    }

    #[test]
    fn split_message_over_limit_on_space() {
        let msg = format!("{} {}", "a".repeat(2000), "b".repeat(3000));
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(2000));
        assert_eq!(chunks[1], "b".repeat(3000));
    }

    #[test]
    fn split_message_no_good_split_point() {
        let msg = "a".repeat(5000);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[1].len(), 904);
    }

    #[test]
    fn split_message_respects_multibyte_boundaries() {
        // Cyrillic letters are two bytes each; 4096 is not a boundary after an odd prefix
        let msg = format!("a{}", "ж".repeat(3000));
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() <= 4096));
        assert_eq!(chunks.concat(), msg);
    }
}
