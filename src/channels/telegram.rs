//! Telegram Bot API adapter: sendMessage plus file download.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::channels::{
    ByteRange, ChannelSender, DeliveryReceipt, MediaBody, MediaFetcher, OutboundPayload,
    read_media_response,
};
use crate::error::ChannelError;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const NAME: &str = "telegram";

/// Telegram channel backed by the Bot API.
pub struct TelegramChannel {
    bot_token: SecretString,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
    chat: SentChat,
}

#[derive(Debug, Deserialize)]
struct SentChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramFile {
    file_path: Option<String>,
}

impl TelegramChannel {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::new(),
        }
    }

    /// Build from `TELEGRAM_BOT_TOKEN`, or `None` when unset.
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("TELEGRAM_BOT_TOKEN").ok()?;
        if token.trim().is_empty() {
            return None;
        }
        Some(Self::new(SecretString::from(token)))
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{method}",
            self.bot_token.expose_secret()
        )
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "https://api.telegram.org/file/bot{}/{file_path}",
            self.bot_token.expose_secret()
        )
    }

    /// Send one chunk and return the `{chat_id}:{message_id}` provider id.
    async fn send_chunk(&self, chat_id: &str, text: &str) -> Result<String, ChannelError> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });

        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| send_failed(e.to_string()))?;

        let status = resp.status();
        let parsed: ApiResponse<SentMessage> = resp
            .json()
            .await
            .map_err(|e| send_failed(format!("sendMessage returned {status}: {e}")))?;

        match parsed.result {
            Some(sent) if parsed.ok => Ok(format!("{}:{}", sent.chat.id, sent.message_id)),
            _ => Err(send_failed(format!(
                "sendMessage failed ({status}): {}",
                parsed.description.unwrap_or_default()
            ))),
        }
    }
}

fn send_failed(reason: String) -> ChannelError {
    ChannelError::SendFailed {
        name: NAME.into(),
        reason,
    }
}

#[async_trait]
impl ChannelSender for TelegramChannel {
    fn name(&self) -> &str {
        NAME
    }

    async fn send(
        &self,
        address: &str,
        payload: &OutboundPayload,
    ) -> Result<DeliveryReceipt, ChannelError> {
        if address.parse::<i64>().is_err() {
            return Err(ChannelError::InvalidAddress {
                name: NAME.into(),
                address: address.into(),
            });
        }

        // Long replies go out as several messages; the first id identifies the send.
        let mut first_id = None;
        for chunk in split_message(&payload.text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            let id = self.send_chunk(address, &chunk).await?;
            first_id.get_or_insert(id);
        }

        tracing::debug!(chat_id = address, "Telegram message sent");
        Ok(DeliveryReceipt::sent(first_id))
    }
}

#[async_trait]
impl MediaFetcher for TelegramChannel {
    async fn fetch(
        &self,
        media_id: &str,
        range: Option<ByteRange>,
    ) -> Result<MediaBody, ChannelError> {
        let resp = self
            .client
            .get(self.api_url("getFile"))
            .query(&[("file_id", media_id)])
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;

        let parsed: ApiResponse<TelegramFile> = resp
            .json()
            .await
            .map_err(|e| ChannelError::Http(format!("getFile response: {e}")))?;

        let Some(file_path) = parsed.result.and_then(|f| f.file_path) else {
            return Err(ChannelError::MediaNotFound {
                name: NAME.into(),
                media_id: media_id.into(),
            });
        };

        let mut request = self.client.get(self.file_url(&file_path));
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range.header_value());
        }
        let resp = request
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;

        read_media_response(NAME, media_id, resp).await
    }
}

/// Split text into chunks of at most `max_len` bytes, preferring newline or
/// space boundaries and never cutting inside a UTF-8 character.
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

        let mut boundary = max_len;
        while !remaining.is_char_boundary(boundary) {
            boundary -= 1;
        }
        let chunk = &remaining[..boundary];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(boundary);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { boundary } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telegram_channel_name() {
        let ch = TelegramChannel::new(SecretString::from("fake-token".to_string()));
        assert_eq!(ch.name(), "telegram");
    }

    #[test]
    fn api_url_embeds_token() {
        let ch = TelegramChannel::new(SecretString::from("123:abc".to_string()));
        assert_eq!(
            ch.api_url("sendMessage"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
        assert_eq!(
            ch.file_url("voice/file_1.oga"),
            "https://api.telegram.org/file/bot123:abc/voice/file_1.oga"
        );
    }

    #[tokio::test]
    async fn non_numeric_chat_id_is_rejected_before_any_request() {
        let ch = TelegramChannel::new(SecretString::from("fake".to_string()));
        let payload = OutboundPayload {
            text: "hi".into(),
            reply_key: None,
        };
        let err = ch.send("not-a-chat", &payload).await.unwrap_err();
        assert!(matches!(err, ChannelError::InvalidAddress { .. }));
    }

    #[test]
    fn split_message_short() {
        let chunks = split_message("Hello", 4096);
        assert_eq!(chunks, vec!["Hello"]);
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
    fn split_message_no_good_split_point() {
        let msg = "a".repeat(5000);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[1].len(), 904);
    }

    #[test]
    fn split_message_respects_char_boundaries() {
        // "é" is two bytes; an odd limit would land mid-character.
        let msg = "é".repeat(10);
        let chunks = split_message(&msg, 5);
        assert!(chunks.iter().all(|c| c.len() <= 5));
        assert_eq!(chunks.concat(), msg);
    }
}
