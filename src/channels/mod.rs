//! Channel capabilities: outbound send and media fetch.
//!
//! Adapters are pure I/O. Idempotency and persistence live in the dispatcher;
//! an adapter never retries a send on its own.

pub mod email;
pub mod meta;
pub mod telegram;
pub mod webchat;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ChannelError;
use crate::identity::model::{Channel, DeliveryStatus};

pub use email::{EmailConfig, EmailSender};
pub use meta::{MetaConfig, MetaGraphChannel};
pub use telegram::TelegramChannel;
pub use webchat::WebChatHub;

/// What an adapter is asked to deliver.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundPayload {
    pub text: String,
    /// Stable key of the reply this payload carries, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_key: Option<String>,
}

/// Provider acknowledgement of a send.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub provider_message_id: Option<String>,
    pub status: DeliveryStatus,
}

impl DeliveryReceipt {
    pub fn sent(provider_message_id: impl Into<Option<String>>) -> Self {
        Self {
            provider_message_id: provider_message_id.into(),
            status: DeliveryStatus::Sent,
        }
    }
}

/// Inclusive byte range requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    /// `None` means "to the end".
    pub end: Option<u64>,
}

impl ByteRange {
    /// Parse a single-range `Range: bytes=a-b` header value.
    ///
    /// Suffix ranges (`bytes=-n`) and multi-range requests are not supported.
    pub fn parse(header: &str) -> Option<Self> {
        let rest = header.trim().strip_prefix("bytes=")?;
        if rest.contains(',') {
            return None;
        }
        let (start, end) = rest.split_once('-')?;
        let start: u64 = start.trim().parse().ok()?;
        let end = match end.trim() {
            "" => None,
            e => Some(e.parse::<u64>().ok()?),
        };
        if end.is_some_and(|e| e < start) {
            return None;
        }
        Some(Self { start, end })
    }

    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{end}", self.start),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Media bytes returned by a fetcher.
#[derive(Debug, Clone)]
pub struct MediaBody {
    pub bytes: Vec<u8>,
    pub content_type: String,
    /// Full size of the underlying object, when known.
    pub total_len: Option<u64>,
    /// Inclusive range actually returned; `None` means the full body.
    pub range: Option<(u64, u64)>,
}

/// Parse `Content-Range: bytes a-b/total` (total may be `*`).
fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?, total))
}

/// Read a provider download into a [`MediaBody`].
///
/// A `206` with a parseable `Content-Range` becomes a ranged body; anything
/// else is treated as the full object.
pub(crate) async fn read_media_response(
    name: &str,
    media_id: &str,
    resp: reqwest::Response,
) -> Result<MediaBody, ChannelError> {
    let status = resp.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(ChannelError::MediaNotFound {
            name: name.into(),
            media_id: media_id.into(),
        });
    }
    if !status.is_success() {
        return Err(ChannelError::Http(format!(
            "{name} media download returned {status}"
        )));
    }

    let header = |key: reqwest::header::HeaderName| {
        resp.headers()
            .get(key)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let content_type = header(reqwest::header::CONTENT_TYPE)
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let content_range = header(reqwest::header::CONTENT_RANGE)
        .as_deref()
        .and_then(parse_content_range);
    let partial = status == reqwest::StatusCode::PARTIAL_CONTENT;

    let bytes = resp
        .bytes()
        .await
        .map_err(|e| ChannelError::Http(e.to_string()))?
        .to_vec();

    Ok(match content_range {
        Some((start, end, total)) if partial => MediaBody {
            bytes,
            content_type,
            total_len: total,
            range: Some((start, end)),
        },
        _ => MediaBody {
            total_len: Some(bytes.len() as u64),
            bytes,
            content_type,
            range: None,
        },
    })
}

/// Sends a message to one external address.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Adapter name for logs (e.g. "telegram").
    fn name(&self) -> &str;

    /// `address` is the provider-native recipient (channel prefix stripped).
    async fn send(
        &self,
        address: &str,
        payload: &OutboundPayload,
    ) -> Result<DeliveryReceipt, ChannelError>;
}

/// Fetches provider-hosted media by id.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(
        &self,
        media_id: &str,
        range: Option<ByteRange>,
    ) -> Result<MediaBody, ChannelError>;
}

/// Per-channel capability lookup.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    senders: HashMap<Channel, Arc<dyn ChannelSender>>,
    fetchers: HashMap<Channel, Arc<dyn MediaFetcher>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sender(mut self, channel: Channel, sender: Arc<dyn ChannelSender>) -> Self {
        self.senders.insert(channel, sender);
        self
    }

    pub fn with_fetcher(mut self, channel: Channel, fetcher: Arc<dyn MediaFetcher>) -> Self {
        self.fetchers.insert(channel, fetcher);
        self
    }

    pub fn sender(&self, channel: Channel) -> Result<Arc<dyn ChannelSender>, ChannelError> {
        self.senders
            .get(&channel)
            .cloned()
            .ok_or_else(|| ChannelError::NotConfigured(channel.to_string()))
    }

    pub fn fetcher(&self, channel: Channel) -> Result<Arc<dyn MediaFetcher>, ChannelError> {
        self.fetchers
            .get(&channel)
            .cloned()
            .ok_or_else(|| ChannelError::NotConfigured(channel.to_string()))
    }

    pub fn configured_senders(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.senders.keys().copied().collect();
        channels.sort_by_key(|c| c.as_str());
        channels
    }
}
