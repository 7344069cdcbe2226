//! Customer identity: contacts, leads, conversations, messages.

pub mod address;
pub mod model;

pub use model::{
    Channel, Contact, Conversation, DeliveryStatus, Direction, Lead, LeadPriority, LeadStage,
    LeadTask, MediaDescriptor, MediaKind, Message, MessageKind, MessageOrigin,
};
