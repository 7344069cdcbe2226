//! Shared types for inbound ingestion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::model::{Channel, Contact, Conversation, Lead, MediaDescriptor, Message};

/// Unified inbound event from any channel.
///
/// The normalizer converts each channel's native webhook payload into this
/// struct. Everything downstream is channel-agnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub channel: Channel,
    /// Provider id, or a synthetic `syn-` id when the provider sent none.
    pub provider_message_id: String,
    /// Raw sender address as the provider reported it.
    pub from_address: String,
    pub from_name: Option<String>,
    pub text: String,
    pub media: Option<MediaDescriptor>,
    pub received_at: DateTime<Utc>,
    /// The payload fragment this event was built from.
    pub raw_payload: serde_json::Value,
}

impl InboundEvent {
    pub fn has_synthetic_id(&self) -> bool {
        self.provider_message_id.starts_with(SYNTHETIC_ID_PREFIX)
    }
}

pub const SYNTHETIC_ID_PREFIX: &str = "syn-";

/// Outcome of resolving one inbound event against the identity store.
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub contact: Contact,
    pub lead: Lead,
    pub conversation: Conversation,
    pub message: Message,
    /// The event had already been ingested; nothing was written.
    pub was_duplicate: bool,
    /// This resolution created the lead.
    pub lead_created: bool,
}
