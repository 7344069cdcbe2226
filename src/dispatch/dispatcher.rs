//! Outbound dispatcher: the single idempotent path for every external send.
//!
//! Before any provider call the dispatcher compares the text against recent
//! non-failed outbound messages for the same (contact, lead, channel), then
//! claims the send with a `PENDING` row so concurrent identical sends see it.
//! Sends are never retried; a timed-out send is persisted as `UNKNOWN` and
//! keeps suppressing resends for the rest of the window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::channels::{ChannelRegistry, OutboundPayload};
use crate::config::PipelineConfig;
use crate::dispatch::similarity::{content_hash, normalize_text, similarity_ratio};
use crate::error::{ChannelError, DispatchError};
use crate::identity::address;
use crate::identity::model::{
    Channel, Conversation, DeliveryStatus, Direction, LeadStage, Message, MessageKind,
    MessageOrigin,
};
use crate::store::Database;

/// A request to send text to a contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub contact_id: Uuid,
    /// Defaults to the conversation's current lead.
    #[serde(default)]
    pub lead_id: Option<Uuid>,
    pub channel: Channel,
    pub text: String,
    pub origin: MessageOrigin,
    #[serde(default)]
    pub reply_key: Option<String>,
}

/// Result of a dispatch attempt.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    /// An external send was made and acknowledged.
    pub sent: bool,
    /// The persisted message: ours, or the one that suppressed us.
    pub message_id: Option<Uuid>,
    pub was_duplicate: bool,
    pub status: Option<DeliveryStatus>,
    pub error: Option<String>,
}

impl DispatchOutcome {
    fn duplicate(message_id: Uuid) -> Self {
        Self {
            sent: false,
            message_id: Some(message_id),
            was_duplicate: true,
            status: None,
            error: None,
        }
    }

    /// Sent, or suppressed as a duplicate. Both look the same to end users.
    pub fn is_success(&self) -> bool {
        self.sent || self.was_duplicate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchKind {
    ExactHash,
    NearDuplicate,
}

impl MatchKind {
    fn as_str(&self) -> &'static str {
        match self {
            MatchKind::ExactHash => "exact",
            MatchKind::NearDuplicate => "near",
        }
    }
}

pub struct Dispatcher {
    store: Arc<dyn Database>,
    channels: ChannelRegistry,
    window: chrono::Duration,
    similarity_threshold: f64,
    send_timeout: Duration,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Database>, channels: ChannelRegistry, config: &PipelineConfig) -> Self {
        Self {
            store,
            channels,
            window: chrono::Duration::from_std(config.outbound_window)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
            similarity_threshold: config.similarity_threshold,
            send_timeout: config.send_timeout,
        }
    }

    pub async fn send(&self, request: OutboundRequest) -> Result<DispatchOutcome, DispatchError> {
        self.send_at(request, Utc::now()).await
    }

    pub async fn send_at(
        &self,
        request: OutboundRequest,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let normalized = normalize_text(&request.text);
        if normalized.is_empty() {
            return Err(DispatchError::EmptyText);
        }
        let hash = content_hash(&normalized);

        let contact = self
            .store
            .get_contact(request.contact_id)
            .await?
            .ok_or(DispatchError::ContactNotFound(request.contact_id))?;
        if contact.channel != request.channel {
            return Err(DispatchError::NoAddressOnChannel {
                contact_id: contact.id,
                channel: request.channel.to_string(),
            });
        }

        let conversation = self.conversation(&request, now).await?;
        let lead_id = request.lead_id.or(conversation.lead_id);
        let since = now - self.window;

        let recent = self
            .store
            .recent_outbound(contact.id, lead_id, request.channel, since)
            .await?;
        if let Some((existing, kind)) =
            self.find_duplicate(&normalized, &hash, &recent)
        {
            info!(
                contact_id = %contact.id,
                channel = %request.channel,
                matched_message_id = %existing,
                match_kind = kind.as_str(),
                "Suppressed duplicate outbound message"
            );
            return Ok(DispatchOutcome::duplicate(existing));
        }

        // Claim the send.
        let claim = Message {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            contact_id: contact.id,
            lead_id,
            channel: request.channel,
            direction: Direction::Outbound,
            kind: MessageKind::Text,
            body: request.text.clone(),
            media: None,
            status: DeliveryStatus::Pending,
            provider_message_id: None,
            content_hash: Some(hash.clone()),
            origin: request.origin,
            reply_key: request.reply_key.clone(),
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_message_if_absent(&claim).await?;

        if let Some(winner) = self.yield_to_older_claim(&claim, &normalized, &hash, since).await? {
            return Ok(DispatchOutcome::duplicate(winner));
        }

        let recipient = address::provider_address(contact.channel, &contact.address);
        let payload = OutboundPayload {
            text: request.text.clone(),
            reply_key: request.reply_key.clone(),
        };
        let result = match self.channels.sender(request.channel) {
            Ok(sender) => {
                match tokio::time::timeout(self.send_timeout, sender.send(&recipient, &payload))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ChannelError::Timeout {
                        name: sender.name().to_string(),
                        timeout: self.send_timeout,
                    }),
                }
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(receipt) => {
                self.store
                    .update_message_delivery(
                        claim.id,
                        receipt.status,
                        receipt.provider_message_id.as_deref(),
                        None,
                        now,
                    )
                    .await?;
                self.store
                    .record_conversation_outbound(conversation.id, now)
                    .await?;
                if let Some(lead_id) = lead_id
                    && self
                        .store
                        .advance_lead_stage(lead_id, LeadStage::New, LeadStage::Contacted, now)
                        .await?
                {
                    info!(lead_id = %lead_id, "Lead advanced to CONTACTED");
                }

                info!(
                    message_id = %claim.id,
                    channel = %request.channel,
                    origin = request.origin.as_str(),
                    "Outbound message sent"
                );
                Ok(DispatchOutcome {
                    sent: true,
                    message_id: Some(claim.id),
                    was_duplicate: false,
                    status: Some(receipt.status),
                    error: None,
                })
            }
            Err(e) => {
                let status = if e.is_unknown_outcome() {
                    DeliveryStatus::Unknown
                } else {
                    DeliveryStatus::Failed
                };
                let reason = e.to_string();
                self.store
                    .update_message_delivery(claim.id, status, None, Some(&reason), now)
                    .await?;
                warn!(
                    message_id = %claim.id,
                    channel = %request.channel,
                    status = status.as_str(),
                    error = %reason,
                    "Outbound send did not complete"
                );
                Ok(DispatchOutcome {
                    sent: false,
                    message_id: Some(claim.id),
                    was_duplicate: false,
                    status: Some(status),
                    error: Some(reason),
                })
            }
        }
    }

    /// Exact hash against any candidate; edit-distance ratio against the most
    /// recent one.
    /// A concurrent identical send may have claimed at the same time; the
    /// older claim wins. The losing claim row is deleted so the suppression
    /// never surfaces as a failed message.
    async fn yield_to_older_claim(
        &self,
        claim: &Message,
        normalized: &str,
        hash: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Uuid>, DispatchError> {
        let recent = self
            .store
            .recent_outbound(claim.contact_id, claim.lead_id, claim.channel, since)
            .await?;
        let older: Vec<Message> = recent
            .into_iter()
            .skip_while(|m| m.id != claim.id)
            .skip(1)
            .collect();
        let Some((winner, kind)) = self.find_duplicate(normalized, hash, &older) else {
            return Ok(None);
        };

        self.store.delete_message(claim.id).await?;
        info!(
            contact_id = %claim.contact_id,
            channel = %claim.channel,
            matched_message_id = %winner,
            match_kind = kind.as_str(),
            "Lost send claim to a concurrent duplicate"
        );
        Ok(Some(winner))
    }

    fn find_duplicate(
        &self,
        normalized: &str,
        hash: &str,
        candidates: &[Message],
    ) -> Option<(Uuid, MatchKind)> {
        if let Some(m) = candidates
            .iter()
            .find(|m| m.content_hash.as_deref() == Some(hash))
        {
            return Some((m.id, MatchKind::ExactHash));
        }
        let latest = candidates.first()?;
        let ratio = similarity_ratio(normalized, &normalize_text(&latest.body));
        (ratio >= self.similarity_threshold).then_some((latest.id, MatchKind::NearDuplicate))
    }

    async fn conversation(
        &self,
        request: &OutboundRequest,
        now: DateTime<Utc>,
    ) -> Result<Conversation, DispatchError> {
        if let Some(existing) = self
            .store
            .find_conversation(request.contact_id, request.channel)
            .await?
        {
            return Ok(existing);
        }

        let fresh = Conversation {
            id: Uuid::new_v4(),
            contact_id: request.contact_id,
            channel: request.channel,
            lead_id: request.lead_id,
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
        self.store.insert_conversation_if_absent(&fresh).await?;
        self.store
            .find_conversation(request.contact_id, request.channel)
            .await?
            .ok_or(DispatchError::ContactNotFound(request.contact_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::test_support::{RecordingSender, resolve_chat};
    use crate::store::LibSqlBackend;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, s).unwrap()
    }

    async fn setup(sender: Arc<RecordingSender>) -> (Arc<dyn Database>, Dispatcher) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let registry = ChannelRegistry::new().with_sender(Channel::Chat, sender);
        let dispatcher = Dispatcher::new(db.clone(), registry, &PipelineConfig::default());
        (db, dispatcher)
    }

    fn request(contact_id: Uuid, text: &str) -> OutboundRequest {
        OutboundRequest {
            contact_id,
            lead_id: None,
            channel: Channel::Chat,
            text: text.into(),
            origin: MessageOrigin::Automation,
            reply_key: None,
        }
    }

    #[tokio::test]
    async fn suppresses_same_text_within_window() {
        let sender = Arc::new(RecordingSender::new());
        let (db, dispatcher) = setup(sender.clone()).await;
        let r = resolve_chat(&db, "m1", "+15550001", "hi").await;

        let first = dispatcher
            .send_at(request(r.contact.id, "Hi John, following up"), at(10, 0, 0))
            .await
            .unwrap();
        let second = dispatcher
            .send_at(request(r.contact.id, "hi john, following up "), at(10, 2, 0))
            .await
            .unwrap();

        assert!(first.sent);
        assert!(second.was_duplicate);
        assert!(second.is_success());
        assert_eq!(second.message_id, first.message_id);
        assert_eq!(sender.sent().len(), 1);
        assert_eq!(sender.sent()[0].0, "+15550001");
    }

    #[tokio::test]
    async fn window_expiry_allows_resend() {
        let sender = Arc::new(RecordingSender::new());
        let (db, dispatcher) = setup(sender.clone()).await;
        let r = resolve_chat(&db, "m1", "+15550001", "hi").await;

        dispatcher
            .send_at(request(r.contact.id, "Following up"), at(10, 0, 0))
            .await
            .unwrap();
        let later = dispatcher
            .send_at(request(r.contact.id, "Following up"), at(10, 6, 0))
            .await
            .unwrap();
        assert!(later.sent);
        assert_eq!(sender.sent().len(), 2);
    }

    #[tokio::test]
    async fn near_duplicate_is_suppressed_but_distinct_text_is_not() {
        let sender = Arc::new(RecordingSender::new());
        let (db, dispatcher) = setup(sender.clone()).await;
        let r = resolve_chat(&db, "m1", "+15550001", "hi").await;

        dispatcher
            .send_at(request(r.contact.id, "Thanks! We will call you tomorrow."), at(10, 0, 0))
            .await
            .unwrap();
        let near = dispatcher
            .send_at(request(r.contact.id, "Thanks! We will call you tomorrow"), at(10, 1, 0))
            .await
            .unwrap();
        let distinct = dispatcher
            .send_at(request(r.contact.id, "What is your budget?"), at(10, 1, 30))
            .await
            .unwrap();

        assert!(near.was_duplicate);
        assert!(distinct.sent);
        assert_eq!(sender.sent().len(), 2);
    }

    #[tokio::test]
    async fn failed_send_is_recorded_and_not_a_dedup_candidate() {
        let sender = Arc::new(RecordingSender::failing());
        let (db, dispatcher) = setup(sender.clone()).await;
        let r = resolve_chat(&db, "m1", "+15550001", "hi").await;

        let outcome = dispatcher
            .send_at(request(r.contact.id, "Hello"), at(10, 0, 0))
            .await
            .unwrap();
        assert!(!outcome.sent);
        assert_eq!(outcome.status, Some(DeliveryStatus::Failed));
        let stored = db.get_message(outcome.message_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Failed);
        assert!(stored.error.is_some());

        // A second attempt is not suppressed by the failed row.
        let retry = dispatcher
            .send_at(request(r.contact.id, "Hello"), at(10, 1, 0))
            .await
            .unwrap();
        assert!(!retry.was_duplicate);
        assert_eq!(sender.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_persists_unknown_and_suppresses_blind_resend() {
        let sender = Arc::new(RecordingSender::hanging());
        let (db, dispatcher) = setup(sender.clone()).await;
        let r = resolve_chat(&db, "m1", "+15550001", "hi").await;

        let outcome = dispatcher
            .send_at(request(r.contact.id, "Hello"), at(10, 0, 0))
            .await
            .unwrap();
        assert_eq!(outcome.status, Some(DeliveryStatus::Unknown));

        let again = dispatcher
            .send_at(request(r.contact.id, "Hello"), at(10, 1, 0))
            .await
            .unwrap();
        assert!(again.was_duplicate);
        assert_eq!(again.message_id, outcome.message_id);
        assert_eq!(sender.attempts(), 1);
    }

    #[tokio::test]
    async fn success_advances_new_lead_and_stamps_conversation() {
        let sender = Arc::new(RecordingSender::new());
        let (db, dispatcher) = setup(sender).await;
        let r = resolve_chat(&db, "m1", "+15550001", "hi").await;

        dispatcher
            .send_at(request(r.contact.id, "Hello"), at(10, 0, 0))
            .await
            .unwrap();

        let lead = db.get_lead(r.lead.id).await.unwrap().unwrap();
        assert_eq!(lead.stage, LeadStage::Contacted);
        let conv = db.get_conversation(r.conversation.id).await.unwrap().unwrap();
        assert_eq!(conv.last_outbound_at, Some(at(10, 0, 0)));
    }

    #[tokio::test]
    async fn concurrent_identical_sends_reach_the_provider_once() {
        let sender = Arc::new(RecordingSender::new());
        let (db, dispatcher) = setup(sender.clone()).await;
        let dispatcher = Arc::new(dispatcher);
        let r = resolve_chat(&db, "m1", "+15550001", "hi").await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let dispatcher = dispatcher.clone();
            let req = request(r.contact.id, "Same text");
            handles.push(tokio::spawn(async move {
                dispatcher.send_at(req, at(10, 0, 0)).await.unwrap()
            }));
        }
        let mut sent = 0;
        for h in handles {
            if h.await.unwrap().sent {
                sent += 1;
            }
        }
        assert_eq!(sent, 1);
        assert_eq!(sender.attempts(), 1);
    }

    #[tokio::test]
    async fn losing_claim_leaves_no_message_behind() {
        let sender = Arc::new(RecordingSender::new());
        let (db, dispatcher) = setup(sender.clone()).await;
        let r = resolve_chat(&db, "m1", "+15550001", "hi").await;

        let text = "Same text";
        let normalized = normalize_text(text);
        let hash = content_hash(&normalized);
        let claim_at = |id: u128, at: DateTime<Utc>| Message {
            id: Uuid::from_u128(id),
            conversation_id: r.conversation.id,
            contact_id: r.contact.id,
            lead_id: r.conversation.lead_id,
            channel: Channel::Chat,
            direction: Direction::Outbound,
            kind: MessageKind::Text,
            body: text.into(),
            media: None,
            status: DeliveryStatus::Pending,
            provider_message_id: None,
            content_hash: Some(hash.clone()),
            origin: MessageOrigin::Automation,
            reply_key: None,
            error: None,
            created_at: at,
            updated_at: at,
        };
        // Two claims that both slipped past the pre-claim check.
        let older = claim_at(1, at(10, 0, 0));
        let younger = claim_at(2, at(10, 0, 1));
        db.insert_message_if_absent(&older).await.unwrap();
        db.insert_message_if_absent(&younger).await.unwrap();

        let since = at(9, 55, 0);
        assert_eq!(
            dispatcher
                .yield_to_older_claim(&younger, &normalized, &hash, since)
                .await
                .unwrap(),
            Some(older.id)
        );
        assert!(db.get_message(younger.id).await.unwrap().is_none());
        // The surviving claim does not yield to anything.
        assert_eq!(
            dispatcher
                .yield_to_older_claim(&older, &normalized, &hash, since)
                .await
                .unwrap(),
            None
        );

        let messages = db.list_messages(r.conversation.id, 50).await.unwrap();
        assert!(messages.iter().all(|m| m.status != DeliveryStatus::Failed));
        assert_eq!(sender.attempts(), 0);
    }

    #[tokio::test]
    async fn rejects_empty_text_and_wrong_channel() {
        let sender = Arc::new(RecordingSender::new());
        let (db, dispatcher) = setup(sender).await;
        let r = resolve_chat(&db, "m1", "+15550001", "hi").await;

        assert!(matches!(
            dispatcher.send_at(request(r.contact.id, "   "), at(10, 0, 0)).await,
            Err(DispatchError::EmptyText)
        ));

        let mut email = request(r.contact.id, "hello");
        email.channel = Channel::Email;
        assert!(matches!(
            dispatcher.send_at(email, at(10, 0, 0)).await,
            Err(DispatchError::NoAddressOnChannel { .. })
        ));
    }
}
