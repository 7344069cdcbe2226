//! Meta Graph API adapter for phone chat (WhatsApp Cloud) and social DMs
//! (Messenger / Instagram).

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::channels::{
    ByteRange, ChannelSender, DeliveryReceipt, MediaBody, MediaFetcher, OutboundPayload,
    read_media_response,
};
use crate::error::ChannelError;
use crate::identity::model::Channel;

const GRAPH_BASE: &str = "https://graph.facebook.com";

/// Graph API credentials, built from environment variables.
#[derive(Debug, Clone)]
pub struct MetaConfig {
    pub access_token: SecretString,
    /// WhatsApp Cloud sender id; required for the phone chat channel.
    pub phone_number_id: Option<String>,
    /// Page id used for Messenger sends (`me` when the token is a page token).
    pub page_id: String,
    pub api_version: String,
}

impl MetaConfig {
    /// `None` when `META_ACCESS_TOKEN` is unset.
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("META_ACCESS_TOKEN").ok()?;
        if token.trim().is_empty() {
            return None;
        }
        Some(Self {
            access_token: SecretString::from(token),
            phone_number_id: std::env::var("META_PHONE_NUMBER_ID").ok(),
            page_id: std::env::var("META_PAGE_ID").unwrap_or_else(|_| "me".to_string()),
            api_version: std::env::var("META_GRAPH_VERSION")
                .unwrap_or_else(|_| "v21.0".to_string()),
        })
    }
}

/// Sender and media fetcher for one Meta-hosted channel.
pub struct MetaGraphChannel {
    config: MetaConfig,
    channel: Channel,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct WhatsAppSendResponse {
    #[serde(default)]
    messages: Vec<WhatsAppMessageId>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppMessageId {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MessengerSendResponse {
    message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MediaInfo {
    url: String,
    mime_type: Option<String>,
}

impl MetaGraphChannel {
    /// Only `Channel::Chat` and `Channel::Social` are served by the Graph API.
    pub fn new(config: MetaConfig, channel: Channel) -> Result<Self, ChannelError> {
        match channel {
            Channel::Chat if config.phone_number_id.is_none() => Err(
                ChannelError::NotConfigured("CHAT (META_PHONE_NUMBER_ID unset)".into()),
            ),
            Channel::Chat | Channel::Social => Ok(Self {
                config,
                channel,
                client: reqwest::Client::new(),
            }),
            other => Err(ChannelError::NotConfigured(format!(
                "{other} is not a Meta Graph channel"
            ))),
        }
    }

    fn graph_url(&self, path: &str) -> String {
        format!("{GRAPH_BASE}/{}/{path}", self.config.api_version)
    }

    fn send_request(&self, address: &str, text: &str) -> (String, serde_json::Value) {
        match self.channel {
            Channel::Chat => {
                let phone_id = self.config.phone_number_id.as_deref().unwrap_or_default();
                (
                    self.graph_url(&format!("{phone_id}/messages")),
                    serde_json::json!({
                        "messaging_product": "whatsapp",
                        "to": address.trim_start_matches('+'),
                        "type": "text",
                        "text": { "body": text },
                    }),
                )
            }
            _ => (
                self.graph_url(&format!("{}/messages", self.config.page_id)),
                serde_json::json!({
                    "recipient": { "id": address },
                    "messaging_type": "RESPONSE",
                    "message": { "text": text },
                }),
            ),
        }
    }

    fn send_failed(&self, reason: String) -> ChannelError {
        ChannelError::SendFailed {
            name: self.name().to_string(),
            reason,
        }
    }
}

#[async_trait]
impl ChannelSender for MetaGraphChannel {
    fn name(&self) -> &str {
        match self.channel {
            Channel::Chat => "whatsapp",
            _ => "messenger",
        }
    }

    async fn send(
        &self,
        address: &str,
        payload: &OutboundPayload,
    ) -> Result<DeliveryReceipt, ChannelError> {
        if address.is_empty() {
            return Err(ChannelError::InvalidAddress {
                name: self.name().to_string(),
                address: address.into(),
            });
        }

        let (url, body) = self.send_request(address, &payload.text);
        let resp = self
            .client
            .post(url)
            .bearer_auth(self.config.access_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| self.send_failed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(self.send_failed(format!("Graph API returned {status}: {detail}")));
        }

        let provider_id = match self.channel {
            Channel::Chat => resp
                .json::<WhatsAppSendResponse>()
                .await
                .map_err(|e| self.send_failed(e.to_string()))?
                .messages
                .into_iter()
                .next()
                .map(|m| m.id),
            _ => resp
                .json::<MessengerSendResponse>()
                .await
                .map_err(|e| self.send_failed(e.to_string()))?
                .message_id,
        };

        Ok(DeliveryReceipt::sent(provider_id))
    }
}

#[async_trait]
impl MediaFetcher for MetaGraphChannel {
    async fn fetch(
        &self,
        media_id: &str,
        range: Option<ByteRange>,
    ) -> Result<MediaBody, ChannelError> {
        let token = self.config.access_token.expose_secret();

        // Resolve the short-lived download URL first.
        let resp = self
            .client
            .get(self.graph_url(media_id))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ChannelError::MediaNotFound {
                name: self.name().to_string(),
                media_id: media_id.into(),
            });
        }
        let info: MediaInfo = resp
            .json()
            .await
            .map_err(|e| ChannelError::Http(format!("media lookup: {e}")))?;

        let mut request = self.client.get(&info.url).bearer_auth(token);
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range.header_value());
        }
        let resp = request
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;

        let mut body = read_media_response(self.name(), media_id, resp).await?;
        if body.content_type == "application/octet-stream"
            && let Some(mime) = info.mime_type
        {
            body.content_type = mime;
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(phone: Option<&str>) -> MetaConfig {
        MetaConfig {
            access_token: SecretString::from("token".to_string()),
            phone_number_id: phone.map(str::to_string),
            page_id: "me".into(),
            api_version: "v21.0".into(),
        }
    }

    #[test]
    fn chat_requires_phone_number_id() {
        assert!(MetaGraphChannel::new(config(None), Channel::Chat).is_err());
        assert!(MetaGraphChannel::new(config(Some("1055")), Channel::Chat).is_ok());
        assert!(MetaGraphChannel::new(config(None), Channel::Social).is_ok());
        assert!(MetaGraphChannel::new(config(None), Channel::Email).is_err());
    }

    #[test]
    fn whatsapp_request_strips_plus() {
        let ch = MetaGraphChannel::new(config(Some("1055")), Channel::Chat).unwrap();
        let (url, body) = ch.send_request("+15550001111", "hello");
        assert_eq!(url, "https://graph.facebook.com/v21.0/1055/messages");
        assert_eq!(body["to"], "15550001111");
        assert_eq!(body["text"]["body"], "hello");
        assert_eq!(ch.name(), "whatsapp");
    }

    #[test]
    fn messenger_request_uses_recipient_id() {
        let ch = MetaGraphChannel::new(config(None), Channel::Social).unwrap();
        let (url, body) = ch.send_request("psid-42", "hello");
        assert_eq!(url, "https://graph.facebook.com/v21.0/me/messages");
        assert_eq!(body["recipient"]["id"], "psid-42");
        assert_eq!(body["messaging_type"], "RESPONSE");
        assert_eq!(ch.name(), "messenger");
    }
}
