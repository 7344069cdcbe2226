//! Auto-match resolver: maps an inbound event onto contact, lead,
//! conversation and message records.
//!
//! Every create is an insert-if-absent against a unique index followed by a
//! re-read, so concurrent deliveries of the same event converge on the same
//! rows without application locks.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::IngestError;
use crate::identity::address;
use crate::identity::model::{
    Contact, Conversation, DeliveryStatus, Direction, Lead, LeadPriority, LeadStage, Message,
    MessageKind, MessageOrigin,
};
use crate::ingest::types::{InboundEvent, Resolution};
use crate::store::Database;

/// Attempts per identity step: the first try plus one retry after a lost race.
const IDENTITY_ATTEMPTS: usize = 2;

pub struct Resolver {
    store: Arc<dyn Database>,
    reopen_on_terminal: bool,
}

impl Resolver {
    pub fn new(store: Arc<dyn Database>, reopen_on_terminal: bool) -> Self {
        Self {
            store,
            reopen_on_terminal,
        }
    }

    /// Resolve one event. Safe to call any number of times for the same event.
    pub async fn resolve(&self, event: &InboundEvent) -> Result<Resolution, IngestError> {
        if let Some(existing) = self
            .store
            .get_message_by_provider_id(event.channel, &event.provider_message_id)
            .await?
        {
            debug!(
                channel = %event.channel,
                provider_message_id = %event.provider_message_id,
                "Duplicate delivery, returning existing message"
            );
            return self.existing(existing).await;
        }

        let normalized = address::normalize(event.channel, &event.from_address).ok_or_else(|| {
            IngestError::Malformed {
                channel: event.channel.as_str().to_string(),
                reason: format!("unusable sender address '{}'", event.from_address),
            }
        })?;

        let contact = self.contact(event, &normalized).await?;
        let (lead, lead_created) = self.lead(&contact).await?;
        let conversation = self.conversation(event, &contact, &lead).await?;

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            contact_id: contact.id,
            lead_id: Some(lead.id),
            channel: event.channel,
            direction: Direction::Inbound,
            kind: if event.media.is_some() {
                MessageKind::Media
            } else {
                MessageKind::Text
            },
            body: event.text.clone(),
            media: event.media.clone(),
            status: DeliveryStatus::Received,
            provider_message_id: Some(event.provider_message_id.clone()),
            content_hash: None,
            origin: MessageOrigin::Customer,
            reply_key: None,
            error: None,
            created_at: event.received_at,
            updated_at: event.received_at,
        };

        if !self.store.insert_message_if_absent(&message).await? {
            // Lost the race to a concurrent delivery of the same event.
            let winner = self
                .store
                .get_message_by_provider_id(event.channel, &event.provider_message_id)
                .await?
                .ok_or_else(|| IngestError::IdentityConflict {
                    entity: "message".into(),
                    key: event.provider_message_id.clone(),
                })?;
            debug!(message_id = %winner.id, "Concurrent duplicate delivery");
            return Ok(Resolution {
                contact,
                lead,
                conversation,
                message: winner,
                was_duplicate: true,
                lead_created,
            });
        }

        self.store
            .record_conversation_inbound(conversation.id, event.received_at)
            .await?;
        let conversation = self
            .store
            .get_conversation(conversation.id)
            .await?
            .unwrap_or(conversation);

        info!(
            channel = %event.channel,
            contact_id = %contact.id,
            lead_id = %lead.id,
            conversation_id = %conversation.id,
            message_id = %message.id,
            lead_created,
            "Inbound message ingested"
        );

        Ok(Resolution {
            contact,
            lead,
            conversation,
            message,
            was_duplicate: false,
            lead_created,
        })
    }

    /// Rebuild the resolution of an already-ingested message without writing.
    async fn existing(&self, message: Message) -> Result<Resolution, IngestError> {
        let conflict = |entity: &str| IngestError::IdentityConflict {
            entity: entity.to_string(),
            key: message.id.to_string(),
        };

        let contact = self
            .store
            .get_contact(message.contact_id)
            .await?
            .ok_or_else(|| conflict("contact"))?;
        let conversation = self
            .store
            .get_conversation(message.conversation_id)
            .await?
            .ok_or_else(|| conflict("conversation"))?;
        let lead_id = message.lead_id.or(conversation.lead_id);
        let lead = match lead_id {
            Some(id) => self.store.get_lead(id).await?,
            None => self.store.get_latest_lead(contact.id).await?,
        }
        .ok_or_else(|| conflict("lead"))?;

        Ok(Resolution {
            contact,
            lead,
            conversation,
            message,
            was_duplicate: true,
            lead_created: false,
        })
    }

    async fn contact(
        &self,
        event: &InboundEvent,
        normalized: &str,
    ) -> Result<Contact, IngestError> {
        for attempt in 0..IDENTITY_ATTEMPTS {
            if let Some(contact) = self.store.get_contact_by_address(normalized).await? {
                if contact.display_name.is_none()
                    && let Some(name) = &event.from_name
                {
                    self.store
                        .set_contact_name_if_missing(contact.id, name, Utc::now())
                        .await?;
                }
                return Ok(contact);
            }

            let now = Utc::now();
            let candidate = Contact {
                id: Uuid::new_v4(),
                address: normalized.to_string(),
                channel: event.channel,
                display_name: event.from_name.clone(),
                created_at: now,
                updated_at: now,
            };
            if self.store.insert_contact_if_absent(&candidate).await? {
                return Ok(candidate);
            }
            warn!(address = %normalized, attempt, "Contact insert lost a race, re-reading");
        }
        Err(IngestError::IdentityConflict {
            entity: "contact".into(),
            key: normalized.to_string(),
        })
    }

    /// The open lead, the reusable terminal lead, or a fresh one.
    async fn lead(&self, contact: &Contact) -> Result<(Lead, bool), IngestError> {
        for attempt in 0..IDENTITY_ATTEMPTS {
            if let Some(open) = self.store.get_open_lead(contact.id).await? {
                return Ok((open, false));
            }
            if !self.reopen_on_terminal
                && let Some(latest) = self.store.get_latest_lead(contact.id).await?
            {
                return Ok((latest, false));
            }

            let now = Utc::now();
            let candidate = Lead {
                id: Uuid::new_v4(),
                contact_id: contact.id,
                stage: LeadStage::New,
                priority: LeadPriority::Normal,
                score: 0,
                next_follow_up_at: None,
                expires_at: None,
                archived_at: None,
                created_at: now,
                updated_at: now,
            };
            if self.store.insert_lead_if_absent(&candidate).await? {
                info!(contact_id = %contact.id, lead_id = %candidate.id, "Lead created");
                return Ok((candidate, true));
            }
            warn!(contact_id = %contact.id, attempt, "Lead insert lost a race, re-reading");
        }
        Err(IngestError::IdentityConflict {
            entity: "lead".into(),
            key: contact.id.to_string(),
        })
    }

    async fn conversation(
        &self,
        event: &InboundEvent,
        contact: &Contact,
        lead: &Lead,
    ) -> Result<Conversation, IngestError> {
        for attempt in 0..IDENTITY_ATTEMPTS {
            if let Some(mut existing) = self.store.find_conversation(contact.id, event.channel).await?
            {
                if existing.lead_id != Some(lead.id) {
                    self.store
                        .set_conversation_lead(existing.id, lead.id, Utc::now())
                        .await?;
                    existing.lead_id = Some(lead.id);
                }
                return Ok(existing);
            }

            let now = Utc::now();
            let candidate = Conversation {
                id: Uuid::new_v4(),
                contact_id: contact.id,
                channel: event.channel,
                lead_id: Some(lead.id),
                last_message_at: None,
                last_inbound_at: None,
                last_outbound_at: None,
                unread_count: 0,
                memory: serde_json::json!({}),
                memory_version: 0,
                archived_at: None,
                created_at: now,
                updated_at: now,
            };
            if self.store.insert_conversation_if_absent(&candidate).await? {
                return Ok(candidate);
            }
            warn!(contact_id = %contact.id, attempt, "Conversation insert lost a race, re-reading");
        }
        Err(IngestError::IdentityConflict {
            entity: "conversation".into(),
            key: format!("{}:{}", contact.id, event.channel),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use serde_json::json;

    use crate::identity::model::Channel;
    use crate::ingest::normalizer::normalize;
    use crate::store::LibSqlBackend;

    async fn store() -> Arc<dyn Database> {
        Arc::new(LibSqlBackend::new_memory().await.unwrap())
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    fn chat_event(id: &str, from: &str, text: &str) -> InboundEvent {
        let payload = json!({ "providerMessageId": id, "from": from, "fromName": "John", "text": text });
        normalize(Channel::Chat, &payload, at()).unwrap().remove(0)
    }

    #[tokio::test]
    async fn first_delivery_creates_identity() {
        let db = store().await;
        let resolver = Resolver::new(db.clone(), true);

        let r = resolver
            .resolve(&chat_event("m1", "+1 555 0001", "hello"))
            .await
            .unwrap();
        assert!(!r.was_duplicate);
        assert!(r.lead_created);
        assert_eq!(r.contact.address, "+15550001");
        assert_eq!(r.contact.display_name.as_deref(), Some("John"));
        assert_eq!(r.lead.stage, LeadStage::New);
        assert_eq!(r.conversation.lead_id, Some(r.lead.id));
        assert_eq!(r.conversation.unread_count, 1);
        assert_eq!(r.conversation.last_inbound_at, Some(at()));
        assert_eq!(r.message.status, DeliveryStatus::Received);
    }

    #[tokio::test]
    async fn redelivery_is_a_no_op() {
        let db = store().await;
        let resolver = Resolver::new(db.clone(), true);
        let event = chat_event("m1", "+15550001", "hello");

        let first = resolver.resolve(&event).await.unwrap();
        let second = resolver.resolve(&event).await.unwrap();

        assert!(second.was_duplicate);
        assert!(!second.lead_created);
        assert_eq!(second.message.id, first.message.id);
        assert_eq!(second.lead.id, first.lead.id);
        let conv = db.get_conversation(first.conversation.id).await.unwrap().unwrap();
        assert_eq!(conv.unread_count, 1);
    }

    #[tokio::test]
    async fn phone_spellings_share_one_contact() {
        let db = store().await;
        let resolver = Resolver::new(db.clone(), true);
        let envelope = json!({
            "entry": [{ "changes": [{ "value": { "messages": [
                { "from": "15550001111", "id": "wamid.1", "type": "text", "text": { "body": "hi" } }
            ]}}]}]
        });
        let from_envelope = normalize(Channel::Chat, &envelope, at()).unwrap().remove(0);

        let first = resolver.resolve(&from_envelope).await.unwrap();
        let second = resolver
            .resolve(&chat_event("m2", "+1 555 000 1111", "still there?"))
            .await
            .unwrap();

        assert_eq!(first.contact.id, second.contact.id);
        assert_eq!(first.contact.address, "+15550001111");
        assert_eq!(first.conversation.id, second.conversation.id);
        assert!(!second.lead_created);
    }

    #[tokio::test]
    async fn concurrent_deliveries_converge() {
        let db = store().await;
        let resolver = Arc::new(Resolver::new(db.clone(), true));
        let event = chat_event("m1", "+15550001", "hello");

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let resolver = resolver.clone();
                let event = event.clone();
                tokio::spawn(async move { resolver.resolve(&event).await })
            })
            .collect();

        let mut resolutions = Vec::new();
        for task in tasks {
            resolutions.push(task.await.unwrap().unwrap());
        }

        let fresh = resolutions.iter().filter(|r| !r.was_duplicate).count();
        assert_eq!(fresh, 1);
        let message_ids: std::collections::HashSet<_> =
            resolutions.iter().map(|r| r.message.id).collect();
        assert_eq!(message_ids.len(), 1);
        let lead_ids: std::collections::HashSet<_> =
            resolutions.iter().map(|r| r.lead.id).collect();
        assert_eq!(lead_ids.len(), 1);

        let conv = db
            .find_conversation(resolutions[0].contact.id, Channel::Chat)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(db.list_messages(conv.id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_contact_new_channel_gets_own_conversation() {
        let db = store().await;
        let resolver = Resolver::new(db.clone(), true);

        let chat = resolver.resolve(&chat_event("m1", "+15550001", "hi")).await.unwrap();
        let email = normalize(
            Channel::Email,
            &json!({ "from": "a@b.test", "text": "hi", "message_id": "e1" }),
            at(),
        )
        .unwrap()
        .remove(0);
        let email = resolver.resolve(&email).await.unwrap();

        assert_ne!(chat.contact.id, email.contact.id);
        assert_ne!(chat.conversation.id, email.conversation.id);
    }

    #[tokio::test]
    async fn terminal_lead_policy() {
        let db = store().await;
        let reopening = Resolver::new(db.clone(), true);
        let first = reopening.resolve(&chat_event("m1", "+1", "hi")).await.unwrap();
        db.update_lead_stage(first.lead.id, LeadStage::CompletedWon, at())
            .await
            .unwrap();

        let reused = Resolver::new(db.clone(), false)
            .resolve(&chat_event("m2", "+1", "again"))
            .await
            .unwrap();
        assert_eq!(reused.lead.id, first.lead.id);
        assert!(!reused.lead_created);

        let reopened = reopening.resolve(&chat_event("m3", "+1", "new job")).await.unwrap();
        assert_ne!(reopened.lead.id, first.lead.id);
        assert!(reopened.lead_created);
        assert_eq!(reopened.conversation.lead_id, Some(reopened.lead.id));
    }
}
