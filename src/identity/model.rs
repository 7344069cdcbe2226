//! Identity data model: contacts, leads, conversations, and messages.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Channel ─────────────────────────────────────────────────────────

/// An external messaging surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    /// Phone-addressed chat (WhatsApp-style).
    Chat,
    /// Telegram bot chat.
    Telegram,
    /// Social network direct messages (Messenger / Instagram).
    Social,
    Email,
    /// Embedded website widget.
    WebChat,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Chat,
        Channel::Telegram,
        Channel::Social,
        Channel::Email,
        Channel::WebChat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Chat => "CHAT",
            Channel::Telegram => "TELEGRAM",
            Channel::Social => "SOCIAL",
            Channel::Email => "EMAIL",
            Channel::WebChat => "WEB_CHAT",
        }
    }

    /// Whether contacts on this channel are addressed by phone number.
    pub fn is_phone(&self) -> bool {
        matches!(self, Channel::Chat)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "CHAT" | "WHATSAPP" => Ok(Channel::Chat),
            "TELEGRAM" => Ok(Channel::Telegram),
            "SOCIAL" | "MESSENGER" | "INSTAGRAM" => Ok(Channel::Social),
            "EMAIL" => Ok(Channel::Email),
            "WEB_CHAT" | "WEBCHAT" | "WEB" => Ok(Channel::WebChat),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

// ── Lead stage / priority ───────────────────────────────────────────

/// Pipeline stage of a lead, ordered informally from first contact to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeadStage {
    New,
    Contacted,
    Qualified,
    Proposal,
    Negotiation,
    CompletedWon,
    CompletedLost,
}

impl LeadStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStage::New => "NEW",
            LeadStage::Contacted => "CONTACTED",
            LeadStage::Qualified => "QUALIFIED",
            LeadStage::Proposal => "PROPOSAL",
            LeadStage::Negotiation => "NEGOTIATION",
            LeadStage::CompletedWon => "COMPLETED_WON",
            LeadStage::CompletedLost => "COMPLETED_LOST",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LeadStage::CompletedWon | LeadStage::CompletedLost)
    }
}

impl fmt::Display for LeadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(LeadStage::New),
            "CONTACTED" => Ok(LeadStage::Contacted),
            "QUALIFIED" => Ok(LeadStage::Qualified),
            "PROPOSAL" => Ok(LeadStage::Proposal),
            "NEGOTIATION" => Ok(LeadStage::Negotiation),
            "COMPLETED_WON" => Ok(LeadStage::CompletedWon),
            "COMPLETED_LOST" => Ok(LeadStage::CompletedLost),
            other => Err(format!("unknown lead stage: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeadPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl LeadPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadPriority::Low => "LOW",
            LeadPriority::Normal => "NORMAL",
            LeadPriority::High => "HIGH",
            LeadPriority::Urgent => "URGENT",
        }
    }
}

impl FromStr for LeadPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(LeadPriority::Low),
            "NORMAL" => Ok(LeadPriority::Normal),
            "HIGH" => Ok(LeadPriority::High),
            "URGENT" => Ok(LeadPriority::Urgent),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

// ── Message enums ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "INBOUND",
            Direction::Outbound => "OUTBOUND",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Text,
    Media,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "TEXT",
            MessageKind::Media => "MEDIA",
        }
    }
}

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    /// Inbound message accepted.
    Received,
    /// Outbound send claimed, provider call in flight.
    Pending,
    Sent,
    Failed,
    /// The provider call timed out; it may or may not have been delivered.
    Unknown,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Received => "RECEIVED",
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Sent => "SENT",
            DeliveryStatus::Failed => "FAILED",
            DeliveryStatus::Unknown => "UNKNOWN",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RECEIVED" => Ok(DeliveryStatus::Received),
            "PENDING" => Ok(DeliveryStatus::Pending),
            "SENT" => Ok(DeliveryStatus::Sent),
            "FAILED" => Ok(DeliveryStatus::Failed),
            "UNKNOWN" => Ok(DeliveryStatus::Unknown),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageOrigin {
    Customer,
    Operator,
    Automation,
}

impl MessageOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageOrigin::Customer => "CUSTOMER",
            MessageOrigin::Operator => "OPERATOR",
            MessageOrigin::Automation => "AUTOMATION",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Document,
}

/// Reference to provider-hosted media attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub media_id: String,
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

// ── Records ─────────────────────────────────────────────────────────

/// A deduplicated external identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    /// Normalized, channel-scoped address. Immutable.
    pub address: String,
    /// Channel the contact first arrived on.
    pub channel: Channel,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A tracked business opportunity tied to a contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub stage: LeadStage,
    pub priority: LeadPriority,
    pub score: i64,
    pub next_follow_up_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    /// Open leads are neither terminal nor archived.
    pub fn is_open(&self) -> bool {
        !self.stage.is_terminal() && self.archived_at.is_none()
    }
}

/// One thread per (contact, channel).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub channel: Channel,
    pub lead_id: Option<Uuid>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_inbound_at: Option<DateTime<Utc>>,
    pub last_outbound_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
    /// Serialized reply state machine.
    pub memory: serde_json::Value,
    /// Bumped on every memory write; used for version-checked updates.
    pub memory_version: i64,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable record of one inbound or outbound unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub contact_id: Uuid,
    pub lead_id: Option<Uuid>,
    pub channel: Channel,
    pub direction: Direction,
    pub kind: MessageKind,
    pub body: String,
    pub media: Option<MediaDescriptor>,
    pub status: DeliveryStatus,
    pub provider_message_id: Option<String>,
    /// SHA-256 of the normalized body, outbound only.
    pub content_hash: Option<String>,
    pub origin: MessageOrigin,
    pub reply_key: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A follow-up task attached to a lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadTask {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub rule_id: Option<Uuid>,
    pub title: String,
    pub due_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
