//! Error types for leadline.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Reply error: {0}")]
    Reply(#[from] ReplyError),

    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Channel collaborator errors (send and media fetch).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("No sender registered for channel {0}")]
    NotConfigured(String),

    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Send on channel {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Media {media_id} not found on channel {name}")]
    MediaNotFound { name: String, media_id: String },

    #[error("Invalid recipient address for channel {name}: {address}")]
    InvalidAddress { name: String, address: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

impl ChannelError {
    /// Whether the send outcome is unknown (the provider may have delivered it).
    pub fn is_unknown_outcome(&self) -> bool {
        matches!(self, ChannelError::Timeout { .. })
    }
}

/// Draft generator errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} returned an empty draft")]
    EmptyResponse { provider: String },

    #[error("Draft generation timed out after {0:?}")]
    Timeout(Duration),
}

/// Inbound normalization and identity resolution errors.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Malformed {channel} payload: {reason}")]
    Malformed { channel: String, reason: String },

    #[error("Webhook signature rejected for channel {0}")]
    SignatureRejected(String),

    #[error("Identity conflict resolving {entity} for {key}")]
    IdentityConflict { entity: String, key: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Outbound dispatch errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Contact {0} not found")]
    ContactNotFound(Uuid),

    #[error("Refusing to send empty text")]
    EmptyText,

    #[error("Contact {contact_id} has no address on channel {channel}")]
    NoAddressOnChannel { contact_id: Uuid, channel: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Reply state machine errors.
#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error("Conversation {0} not found")]
    ConversationNotFound(Uuid),

    #[error("Conversation {id} memory kept changing after {attempts} attempts")]
    Conflict { id: Uuid, attempts: u32 },

    #[error("Conversation {id} memory is unreadable: {reason}")]
    CorruptMemory { id: Uuid, reason: String },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Automation rule errors.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Invalid rule: {0}")]
    Invalid(String),

    #[error("Rule {0} not found")]
    NotFound(Uuid),

    #[error("Action {index} ({action}) failed: {reason}")]
    ActionFailed {
        index: usize,
        action: String,
        reason: String,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
