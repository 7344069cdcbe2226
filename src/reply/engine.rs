//! Reply engine: loads reply state, applies the machine, persists with a
//! version-checked write, then hands the planned reply to the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::dispatch::{DispatchOutcome, Dispatcher, OutboundRequest};
use crate::error::ReplyError;
use crate::identity::model::{Conversation, Direction, MessageOrigin};
use crate::ingest::Resolution;
use crate::llm::{DraftContext, DraftGenerator, draft_or_fallback};
use crate::reply::extract::FieldExtractor;
use crate::reply::flows::FlowCatalog;
use crate::reply::machine::{
    FollowUpSkip, PlannedReply, Transition, apply_inbound, plan_follow_up, plan_reply,
};
use crate::reply::state::{ReplyState, StopReason};
use crate::store::Database;

/// Result of handling one inbound message.
#[derive(Debug, Clone, Serialize)]
pub struct ReplyOutcome {
    pub conversation_id: Uuid,
    pub transition: &'static str,
    pub question_key: Option<String>,
    pub dispatch: Option<DispatchOutcome>,
}

/// Result of a follow-up request.
#[derive(Debug, Clone)]
pub enum FollowUpOutcome {
    Sent {
        question_key: String,
        dispatch: DispatchOutcome,
    },
    Skipped(FollowUpSkip),
}

/// Whether a state mutation needs to be written back.
enum Mutation<T> {
    Write(T),
    Skip(T),
}

pub struct ReplyEngine {
    store: Arc<dyn Database>,
    dispatcher: Arc<Dispatcher>,
    drafter: Arc<dyn DraftGenerator>,
    flows: Arc<FlowCatalog>,
    extractor: Arc<dyn FieldExtractor>,
    memory_write_attempts: u32,
    draft_timeout: Duration,
    max_follow_ups: u32,
}

impl ReplyEngine {
    pub fn new(
        store: Arc<dyn Database>,
        dispatcher: Arc<Dispatcher>,
        drafter: Arc<dyn DraftGenerator>,
        flows: Arc<FlowCatalog>,
        extractor: Arc<dyn FieldExtractor>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            drafter,
            flows,
            extractor,
            memory_write_attempts: config.memory_write_attempts.max(1),
            draft_timeout: config.draft_timeout,
            max_follow_ups: config.max_follow_ups,
        }
    }

    /// Current reply state of a conversation.
    pub async fn load_state(&self, conversation_id: Uuid) -> Result<ReplyState, ReplyError> {
        let conversation = self.conversation(conversation_id).await?;
        decode_state(&conversation)
    }

    pub async fn handle_inbound(&self, resolution: &Resolution) -> Result<ReplyOutcome, ReplyError> {
        self.handle_inbound_at(resolution, Utc::now()).await
    }

    /// Apply an inbound message and send the planned reply, if any.
    pub async fn handle_inbound_at(
        &self,
        resolution: &Resolution,
        now: DateTime<Utc>,
    ) -> Result<ReplyOutcome, ReplyError> {
        let message = &resolution.message;
        let conversation_id = resolution.conversation.id;
        if message.direction != Direction::Inbound {
            return Ok(ReplyOutcome {
                conversation_id,
                transition: Transition::Replayed.as_str(),
                question_key: None,
                dispatch: None,
            });
        }

        let inbound_id = message.id.to_string();
        let text = message.body.clone();
        let (conversation, state, (transition, planned)) = self
            .update_state(conversation_id, now, |state| {
                let t = apply_inbound(
                    state,
                    &self.flows,
                    self.extractor.as_ref(),
                    &inbound_id,
                    &text,
                    now,
                );
                if t == Transition::Replayed {
                    return Mutation::Skip((t, None));
                }
                let flow = self.flows.resolve(state.service_key.as_deref());
                let planned = plan_reply(state, flow, conversation_id);
                Mutation::Write((t, planned))
            })
            .await?;

        debug!(
            conversation_id = %conversation_id,
            transition = transition.as_str(),
            stage = state.stage.as_str(),
            "Applied inbound message to reply state"
        );
        if transition == Transition::OptedOut {
            info!(conversation_id = %conversation_id, "Customer opted out; automation stopped");
        }

        let Some(planned) = planned else {
            return Ok(ReplyOutcome {
                conversation_id,
                transition: transition.as_str(),
                question_key: None,
                dispatch: None,
            });
        };

        let dispatch = self
            .deliver(&conversation, &state, &planned, Some(text), now)
            .await?;
        Ok(ReplyOutcome {
            conversation_id,
            transition: transition.as_str(),
            question_key: Some(planned.question_key),
            dispatch: Some(dispatch),
        })
    }

    pub async fn follow_up(&self, conversation_id: Uuid) -> Result<FollowUpOutcome, ReplyError> {
        self.follow_up_at(conversation_id, Utc::now()).await
    }

    /// Re-ask the outstanding question as the next follow-up step.
    pub async fn follow_up_at(
        &self,
        conversation_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<FollowUpOutcome, ReplyError> {
        let max = self.max_follow_ups;
        let (conversation, state, planned) = self
            .update_state(conversation_id, now, |state| {
                let flow = self.flows.resolve(state.service_key.as_deref());
                match plan_follow_up(state, flow, conversation_id, max) {
                    Ok(planned) => Mutation::Write(Ok(planned)),
                    Err(skip) => Mutation::Skip(Err(skip)),
                }
            })
            .await?;

        let planned = match planned {
            Ok(planned) => planned,
            Err(skip) => {
                debug!(conversation_id = %conversation_id, reason = skip.as_str(), "Follow-up skipped");
                return Ok(FollowUpOutcome::Skipped(skip));
            }
        };

        info!(
            conversation_id = %conversation_id,
            step = state.follow_up_step,
            question_key = %planned.question_key,
            "Sending follow-up"
        );
        let dispatch = self
            .deliver(&conversation, &state, &planned, None, now)
            .await?;
        Ok(FollowUpOutcome::Sent {
            question_key: planned.question_key,
            dispatch,
        })
    }

    /// Set the sticky stop flag. An existing stop keeps its original reason.
    pub async fn stop(
        &self,
        conversation_id: Uuid,
        reason: StopReason,
        now: DateTime<Utc>,
    ) -> Result<ReplyState, ReplyError> {
        let (_, state, ()) = self
            .update_state(conversation_id, now, |state| {
                if state.is_stopped() {
                    return Mutation::Skip(());
                }
                state.stop(reason, now);
                Mutation::Write(())
            })
            .await?;
        info!(conversation_id = %conversation_id, reason = reason.as_str(), "Automation stopped");
        Ok(state)
    }

    /// Clear the stop flag (operator action).
    pub async fn clear_stop(
        &self,
        conversation_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReplyState, ReplyError> {
        let (_, state, ()) = self
            .update_state(conversation_id, now, |state| {
                if !state.is_stopped() {
                    return Mutation::Skip(());
                }
                state.clear_stop();
                Mutation::Write(())
            })
            .await?;
        info!(conversation_id = %conversation_id, "Automation resumed by operator");
        Ok(state)
    }

    /// Load, mutate and write back the reply state, retrying on version
    /// conflicts. The closure is re-run against fresh state on every attempt.
    async fn update_state<T, F>(
        &self,
        conversation_id: Uuid,
        now: DateTime<Utc>,
        mut mutate: F,
    ) -> Result<(Conversation, ReplyState, T), ReplyError>
    where
        F: FnMut(&mut ReplyState) -> Mutation<T>,
    {
        for attempt in 1..=self.memory_write_attempts {
            let conversation = self.conversation(conversation_id).await?;
            let mut state = decode_state(&conversation)?;

            let value = match mutate(&mut state) {
                Mutation::Skip(value) => return Ok((conversation, state, value)),
                Mutation::Write(value) => value,
            };

            if self
                .store
                .update_conversation_memory(
                    conversation_id,
                    conversation.memory_version,
                    &state.to_memory(),
                    now,
                )
                .await?
            {
                return Ok((conversation, state, value));
            }
            warn!(
                conversation_id = %conversation_id,
                attempt,
                "Reply state changed underneath us, reloading"
            );
        }
        Err(ReplyError::Conflict {
            id: conversation_id,
            attempts: self.memory_write_attempts,
        })
    }

    async fn conversation(&self, id: Uuid) -> Result<Conversation, ReplyError> {
        self.store
            .get_conversation(id)
            .await?
            .ok_or(ReplyError::ConversationNotFound(id))
    }

    async fn deliver(
        &self,
        conversation: &Conversation,
        state: &ReplyState,
        planned: &PlannedReply,
        last_inbound: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, ReplyError> {
        let contact_name = match state.collected.get("name") {
            Some(field) => Some(field.value.clone()),
            None => self
                .store
                .get_contact(conversation.contact_id)
                .await?
                .and_then(|c| c.display_name),
        };

        let ctx = DraftContext {
            channel: conversation.channel,
            contact_name,
            question_key: planned.question_key.clone(),
            last_inbound,
            collected: state.collected_pairs(),
            fallback: planned.fallback_text.clone(),
        };
        let text = draft_or_fallback(self.drafter.as_ref(), &ctx, self.draft_timeout).await;

        Ok(self
            .dispatcher
            .send_at(
                OutboundRequest {
                    contact_id: conversation.contact_id,
                    lead_id: conversation.lead_id,
                    channel: conversation.channel,
                    text,
                    origin: MessageOrigin::Automation,
                    reply_key: Some(planned.reply_key.clone()),
                },
                now,
            )
            .await?)
    }
}

/// Decode a conversation's reply memory, refusing to guess at a broken blob.
fn decode_state(conversation: &Conversation) -> Result<ReplyState, ReplyError> {
    ReplyState::from_memory(&conversation.memory).map_err(|e| {
        error!(conversation_id = %conversation.id, error = %e, "Reply state is unreadable");
        ReplyError::CorruptMemory {
            id: conversation.id,
            reason: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::channels::ChannelRegistry;
    use crate::identity::model::Channel;
    use crate::llm::TemplateDraftGenerator;
    use crate::reply::extract::RegexFieldExtractor;
    use crate::reply::state::ReplyStage;
    use crate::store::LibSqlBackend;
    use crate::test_support::{RecordingSender, resolve_chat};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    struct Harness {
        db: Arc<dyn Database>,
        sender: Arc<RecordingSender>,
        engine: ReplyEngine,
    }

    async fn harness() -> Harness {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let sender = Arc::new(RecordingSender::new());
        let config = PipelineConfig::default();
        let dispatcher = Arc::new(Dispatcher::new(
            db.clone(),
            ChannelRegistry::new().with_sender(Channel::Chat, sender.clone()),
            &config,
        ));
        let engine = ReplyEngine::new(
            db.clone(),
            dispatcher,
            Arc::new(TemplateDraftGenerator),
            Arc::new(FlowCatalog::builtin()),
            Arc::new(RegexFieldExtractor::default()),
            &config,
        );
        Harness { db, sender, engine }
    }

    #[tokio::test]
    async fn inbound_name_asks_for_service() {
        let h = harness().await;
        let r = resolve_chat(&h.db, "m1", "+15550001", "Hi, my name is John").await;

        let outcome = h.engine.handle_inbound_at(&r, at(10, 0)).await.unwrap();
        assert_eq!(outcome.question_key.as_deref(), Some("service"));
        assert!(outcome.dispatch.unwrap().sent);
        assert_eq!(h.sender.texts(), vec!["Which service are you interested in?"]);

        let state = h.engine.load_state(r.conversation.id).await.unwrap();
        assert_eq!(state.next_question_key.as_deref(), Some("service"));
        let conv = h.db.get_conversation(r.conversation.id).await.unwrap().unwrap();
        assert_eq!(conv.memory_version, 1);

        let stored = h.db.list_messages(r.conversation.id, 10).await.unwrap();
        let reply = stored.last().unwrap();
        assert_eq!(reply.origin, MessageOrigin::Automation);
        assert_eq!(reply.reply_key, state.last_reply_key);
    }

    #[tokio::test]
    async fn replayed_inbound_sends_nothing_more() {
        let h = harness().await;
        let r = resolve_chat(&h.db, "m1", "+15550001", "hello").await;

        h.engine.handle_inbound_at(&r, at(10, 0)).await.unwrap();
        let again = h.engine.handle_inbound_at(&r, at(10, 1)).await.unwrap();

        assert_eq!(again.transition, "replayed");
        assert!(again.dispatch.is_none());
        assert_eq!(h.sender.attempts(), 1);
        let state = h.engine.load_state(r.conversation.id).await.unwrap();
        assert_eq!(state.asked_question_keys, vec!["name"]);
    }

    #[tokio::test]
    async fn concurrent_handling_of_same_message_asks_once() {
        let h = harness().await;
        let engine = Arc::new(h.engine);
        let r = resolve_chat(&h.db, "m1", "+15550001", "hello").await;

        let mut handles = Vec::new();
        for _ in 0..3 {
            let engine = engine.clone();
            let r = r.clone();
            handles.push(tokio::spawn(async move {
                engine.handle_inbound_at(&r, at(10, 0)).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(h.sender.attempts(), 1);
        let state = engine.load_state(r.conversation.id).await.unwrap();
        assert_eq!(state.processed_inbound_ids.len(), 1);
        assert_eq!(state.asked_question_keys, vec!["name"]);
    }

    #[tokio::test]
    async fn writes_on_top_of_a_bumped_version() {
        let h = harness().await;
        let r = resolve_chat(&h.db, "m1", "+15550001", "hello").await;

        // Another writer bumps the version between load and write.
        let conv = h.db.get_conversation(r.conversation.id).await.unwrap().unwrap();
        assert!(h
            .db
            .update_conversation_memory(conv.id, conv.memory_version, &serde_json::json!({}), at(9, 59))
            .await
            .unwrap());

        let outcome = h.engine.handle_inbound_at(&r, at(10, 0)).await.unwrap();
        assert_eq!(outcome.question_key.as_deref(), Some("name"));
        let conv = h.db.get_conversation(r.conversation.id).await.unwrap().unwrap();
        assert_eq!(conv.memory_version, 2);
    }

    #[tokio::test]
    async fn stopped_conversation_gets_no_replies_until_cleared() {
        let h = harness().await;
        let r = resolve_chat(&h.db, "m1", "+15550001", "hello").await;

        h.engine
            .stop(r.conversation.id, StopReason::Operator, at(9, 30))
            .await
            .unwrap();
        let outcome = h.engine.handle_inbound_at(&r, at(10, 0)).await.unwrap();
        assert!(outcome.dispatch.is_none());
        assert!(matches!(
            h.engine.follow_up_at(r.conversation.id, at(11, 0)).await.unwrap(),
            FollowUpOutcome::Skipped(FollowUpSkip::Stopped)
        ));
        assert_eq!(h.sender.attempts(), 0);

        let state = h.engine.clear_stop(r.conversation.id, at(12, 0)).await.unwrap();
        assert!(!state.is_stopped());
        assert!(matches!(
            h.engine.follow_up_at(r.conversation.id, at(12, 1)).await.unwrap(),
            FollowUpOutcome::Sent { .. }
        ));
    }

    #[tokio::test]
    async fn unreadable_memory_blocks_automated_replies() {
        let h = harness().await;
        let r = resolve_chat(&h.db, "m1", "+15550001", "hello").await;
        let blob = serde_json::json!({ "stop": { "enabled": true, "reason": "LEGAL_HOLD" } });
        assert!(h
            .db
            .update_conversation_memory(r.conversation.id, r.conversation.memory_version, &blob, at(9, 0))
            .await
            .unwrap());

        let err = h.engine.handle_inbound_at(&r, at(10, 0)).await.unwrap_err();
        assert!(matches!(err, ReplyError::CorruptMemory { .. }));
        assert!(h.engine.follow_up_at(r.conversation.id, at(11, 0)).await.is_err());
        assert_eq!(h.sender.attempts(), 0);

        // The blob is left for an operator to inspect.
        let stored = h.db.get_conversation(r.conversation.id).await.unwrap().unwrap();
        assert_eq!(stored.memory, blob);
    }

    #[tokio::test]
    async fn follow_ups_are_distinct_sends_until_exhausted() {
        let h = harness().await;
        let r = resolve_chat(&h.db, "m1", "+15550001", "hello").await;
        h.engine.handle_inbound_at(&r, at(10, 0)).await.unwrap();

        // Same question text re-asked: spaced beyond the dedup window.
        for (i, hour) in [11, 12, 13].into_iter().enumerate() {
            let outcome = h.engine.follow_up_at(r.conversation.id, at(hour, 0)).await.unwrap();
            assert!(matches!(outcome, FollowUpOutcome::Sent { .. }), "step {i}");
        }
        assert!(matches!(
            h.engine.follow_up_at(r.conversation.id, at(14, 0)).await.unwrap(),
            FollowUpOutcome::Skipped(FollowUpSkip::Exhausted)
        ));
        assert_eq!(h.sender.attempts(), 4);
    }

    #[tokio::test]
    async fn opt_out_stops_automation() {
        let h = harness().await;
        let r = resolve_chat(&h.db, "m1", "+15550001", "unsubscribe").await;

        let outcome = h.engine.handle_inbound_at(&r, at(10, 0)).await.unwrap();
        assert_eq!(outcome.transition, "opted_out");
        assert!(outcome.dispatch.is_none());
        let state = h.engine.load_state(r.conversation.id).await.unwrap();
        assert_eq!(state.stop.reason, Some(StopReason::OptOut));
        assert_eq!(state.stage, ReplyStage::Collecting);
    }
}
