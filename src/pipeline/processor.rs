//! Inbound processor: normalizes a webhook delivery, resolves each event
//! inline, then runs the reply engine and event rules off the request path.
//!
//! Flow:
//! 1. `normalize()` into canonical events (pure, may fail as malformed)
//! 2. `Resolver::resolve()` per event (dedup + identity, inline)
//! 3. Spawned follow-on per new message: reply engine, then event rules

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::automation::{AutomationEngine, RuleEvent};
use crate::error::IngestError;
use crate::identity::model::Channel;
use crate::ingest::{Resolution, Resolver, normalize};
use crate::reply::ReplyEngine;

pub struct InboundProcessor {
    resolver: Resolver,
    replies: Arc<ReplyEngine>,
    automation: Arc<AutomationEngine>,
}

impl InboundProcessor {
    pub fn new(
        resolver: Resolver,
        replies: Arc<ReplyEngine>,
        automation: Arc<AutomationEngine>,
    ) -> Self {
        Self {
            resolver,
            replies,
            automation,
        }
    }

    /// Resolve a delivery and schedule the follow-on work.
    ///
    /// Follow-on work for a new message is spawned as soon as that message
    /// is persisted, so a later event failing cannot strand it.
    pub async fn process(
        self: &Arc<Self>,
        channel: Channel,
        payload: &serde_json::Value,
        received_at: DateTime<Utc>,
    ) -> Result<Vec<Resolution>, IngestError> {
        self.resolve_delivery(channel, payload, received_at, |resolution| {
            let this = Arc::clone(self);
            let resolution = resolution.clone();
            tokio::spawn(async move {
                this.after_resolution(&resolution, Utc::now()).await;
            });
        })
        .await
    }

    /// Normalize and resolve without triggering automation.
    pub async fn ingest(
        &self,
        channel: Channel,
        payload: &serde_json::Value,
        received_at: DateTime<Utc>,
    ) -> Result<Vec<Resolution>, IngestError> {
        self.resolve_delivery(channel, payload, received_at, |_| {})
            .await
    }

    /// Resolve every event of a delivery, handing each new message to
    /// `on_new`. A failed event is logged and skipped; the delivery fails
    /// only when no event resolved.
    async fn resolve_delivery<F>(
        &self,
        channel: Channel,
        payload: &serde_json::Value,
        received_at: DateTime<Utc>,
        mut on_new: F,
    ) -> Result<Vec<Resolution>, IngestError>
    where
        F: FnMut(&Resolution) + Send,
    {
        let events = normalize(channel, payload, received_at)?;
        debug!(channel = channel.as_str(), count = events.len(), "Normalized delivery");

        let mut resolutions = Vec::with_capacity(events.len());
        let mut first_error = None;
        for event in &events {
            let resolution = match self.resolver.resolve(event).await {
                Ok(resolution) => resolution,
                Err(e) => {
                    error!(
                        channel = channel.as_str(),
                        provider_message_id = %event.provider_message_id,
                        error = %e,
                        "Failed to resolve inbound event, continuing with the rest"
                    );
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            if resolution.was_duplicate {
                info!(
                    channel = channel.as_str(),
                    provider_message_id = %event.provider_message_id,
                    "Duplicate delivery ignored"
                );
            } else {
                info!(
                    channel = channel.as_str(),
                    contact_id = %resolution.contact.id,
                    conversation_id = %resolution.conversation.id,
                    lead_created = resolution.lead_created,
                    "Inbound message stored"
                );
                on_new(&resolution);
            }
            resolutions.push(resolution);
        }

        match first_error {
            Some(e) if resolutions.is_empty() => Err(e),
            _ => Ok(resolutions),
        }
    }

    /// Reply engine first, so rules see the updated stop flag; then event
    /// rules. Failures are logged and never propagate to the webhook.
    pub async fn after_resolution(&self, resolution: &Resolution, now: DateTime<Utc>) {
        let conversation_id = resolution.conversation.id;

        match self.replies.handle_inbound_at(resolution, now).await {
            Ok(outcome) => debug!(
                conversation_id = %conversation_id,
                transition = outcome.transition,
                question_key = ?outcome.question_key,
                "Reply engine finished"
            ),
            Err(e) => error!(conversation_id = %conversation_id, error = %e, "Reply engine failed"),
        }

        let mut events = Vec::with_capacity(2);
        if resolution.lead_created {
            events.push(RuleEvent::LeadCreated);
        }
        events.push(RuleEvent::InboundMessage);

        for event in events {
            match self.automation.on_event(event, resolution, now).await {
                Ok(runs) if !runs.is_empty() => {
                    debug!(conversation_id = %conversation_id, event = ?event, runs = runs.len(), "Event rules evaluated");
                }
                Ok(_) => {}
                Err(e) => warn!(conversation_id = %conversation_id, event = ?event, error = %e, "Event rules failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::TimeZone;
    use serde_json::json;
    use tokio::time::timeout;

    use crate::automation::{RuleAction, RuleDraft, RuleTrigger, RunOutcome};
    use crate::channels::ChannelRegistry;
    use crate::config::PipelineConfig;
    use crate::dispatch::Dispatcher;
    use crate::llm::TemplateDraftGenerator;
    use crate::reply::{FlowCatalog, RegexFieldExtractor};
    use crate::store::{Database, LibSqlBackend};
    use crate::test_support::RecordingSender;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    async fn processor() -> (Arc<dyn Database>, Arc<RecordingSender>, Arc<InboundProcessor>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let sender = Arc::new(RecordingSender::new());
        let config = PipelineConfig::default();
        let dispatcher = Arc::new(Dispatcher::new(
            db.clone(),
            ChannelRegistry::new().with_sender(Channel::Chat, sender.clone()),
            &config,
        ));
        let replies = Arc::new(ReplyEngine::new(
            db.clone(),
            dispatcher.clone(),
            Arc::new(TemplateDraftGenerator),
            Arc::new(FlowCatalog::builtin()),
            Arc::new(RegexFieldExtractor::default()),
            &config,
        ));
        let automation = Arc::new(AutomationEngine::new(db.clone(), dispatcher, replies.clone()));
        let processor = Arc::new(InboundProcessor::new(
            Resolver::new(db.clone(), config.reopen_on_terminal),
            replies,
            automation,
        ));
        (db, sender, processor)
    }

    fn whatsapp(id: &str, text: &str) -> serde_json::Value {
        json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "contacts": [{ "wa_id": "15550001111", "profile": { "name": "John" } }],
                        "messages": [{
                            "id": id,
                            "from": "15550001111",
                            "timestamp": "1772442000",
                            "type": "text",
                            "text": { "body": text }
                        }]
                    }
                }]
            }]
        })
    }

    #[tokio::test]
    async fn repeated_delivery_resolves_once() {
        let (_db, _sender, processor) = processor().await;
        let first = processor.ingest(Channel::Chat, &whatsapp("wamid.1", "hello"), at(9, 0)).await.unwrap();
        let again = processor.ingest(Channel::Chat, &whatsapp("wamid.1", "hello"), at(9, 0)).await.unwrap();

        assert!(!first[0].was_duplicate);
        assert!(again[0].was_duplicate);
        assert_eq!(first[0].message.id, again[0].message.id);
    }

    #[tokio::test]
    async fn follow_on_replies_and_runs_lead_created_rules() {
        let (db, sender, processor) = processor().await;
        let rule = processor
            .automation
            .create_rule(
                RuleDraft {
                    name: "new lead task".into(),
                    enabled: true,
                    trigger: RuleTrigger::Event {
                        event: RuleEvent::LeadCreated,
                    },
                    conditions: vec![],
                    cooldown_minutes: 0,
                    actions: vec![RuleAction::CreateTask {
                        title: "Call new lead".into(),
                        due_in_hours: None,
                    }],
                },
                at(8, 0),
            )
            .await
            .unwrap();

        let resolutions = processor
            .ingest(Channel::Chat, &whatsapp("wamid.1", "Hi, my name is John"), at(9, 0))
            .await
            .unwrap();
        processor.after_resolution(&resolutions[0], at(9, 0)).await;

        assert_eq!(sender.texts(), vec!["Which service are you interested in?"]);
        let runs = db.list_rule_runs(rule.id, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, RunOutcome::Fired);
    }

    #[tokio::test]
    async fn good_message_in_mixed_envelope_gets_a_reply() {
        let (db, sender, processor) = processor().await;
        let payload = json!({
            "entry": [{ "changes": [{ "value": {
                "contacts": [{ "wa_id": "15550001111", "profile": { "name": "John" } }],
                "messages": [
                    { "id": "wamid.1", "type": "text", "text": { "body": "lost sender" } },
                    { "from": "15550001111", "id": "wamid.2", "type": "text",
                      "text": { "body": "Hi, my name is John" } }
                ]
            }}]}]
        });

        let resolutions = processor.process(Channel::Chat, &payload, at(9, 0)).await.unwrap();
        assert_eq!(resolutions.len(), 1);
        assert!(!resolutions[0].was_duplicate);

        // Follow-on work runs in a spawned task.
        timeout(Duration::from_secs(5), async {
            while sender.texts().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("reply was not sent");
        assert_eq!(sender.texts(), vec!["Which service are you interested in?"]);
        assert!(db
            .get_message_by_provider_id(Channel::Chat, "wamid.1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn malformed_payload_is_reported() {
        let (_db, _sender, processor) = processor().await;
        let err = processor
            .ingest(Channel::WebChat, &json!({ "text": "hi" }), at(9, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Malformed { .. }));
    }
}
