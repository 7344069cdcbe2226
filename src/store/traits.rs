//! Unified `Database` trait: single async interface for all persistence.
//!
//! Write methods that can race (contacts, open leads, conversations, inbound
//! messages) are insert-if-absent: they return whether this call created the
//! row, and callers re-read to observe the winner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::automation::rule::{AutomationRule, RuleRun, RunOutcome};
use crate::error::DatabaseError;
use crate::identity::model::{
    Channel, Contact, Conversation, DeliveryStatus, Lead, LeadPriority, LeadStage, LeadTask,
    Message,
};

/// Backend-agnostic database trait covering identity, messages, and automation.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Contacts ────────────────────────────────────────────────────

    /// Insert a contact unless one with the same address exists.
    async fn insert_contact_if_absent(&self, contact: &Contact) -> Result<bool, DatabaseError>;

    async fn get_contact(&self, id: Uuid) -> Result<Option<Contact>, DatabaseError>;

    async fn get_contact_by_address(&self, address: &str)
    -> Result<Option<Contact>, DatabaseError>;

    /// Fill in a display name the contact does not have yet.
    async fn set_contact_name_if_missing(
        &self,
        id: Uuid,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Leads ───────────────────────────────────────────────────────

    /// Insert a lead unless the contact already has an open one.
    async fn insert_lead_if_absent(&self, lead: &Lead) -> Result<bool, DatabaseError>;

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError>;

    /// The contact's single non-terminal, non-archived lead.
    async fn get_open_lead(&self, contact_id: Uuid) -> Result<Option<Lead>, DatabaseError>;

    /// The contact's most recently created non-archived lead, open or not.
    async fn get_latest_lead(&self, contact_id: Uuid) -> Result<Option<Lead>, DatabaseError>;

    async fn update_lead_stage(
        &self,
        id: Uuid,
        stage: LeadStage,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Move a lead from `from` to `to` only if it is still at `from`.
    /// Returns whether the row changed.
    async fn advance_lead_stage(
        &self,
        id: Uuid,
        from: LeadStage,
        to: LeadStage,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn update_lead_priority(
        &self,
        id: Uuid,
        priority: LeadPriority,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn adjust_lead_score(
        &self,
        id: Uuid,
        delta: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn set_lead_follow_up(
        &self,
        id: Uuid,
        at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn set_lead_expiry(
        &self,
        id: Uuid,
        at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Soft-delete a lead.
    async fn archive_lead(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), DatabaseError>;

    /// Open leads whose follow-up time is at or before `now`.
    async fn list_follow_up_due(&self, now: DateTime<Utc>) -> Result<Vec<Lead>, DatabaseError>;

    /// Open leads expiring in `[now, until]`.
    async fn list_expiring(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Lead>, DatabaseError>;

    // ── Conversations ───────────────────────────────────────────────

    /// Insert a conversation unless one exists for (contact, channel).
    async fn insert_conversation_if_absent(
        &self,
        conversation: &Conversation,
    ) -> Result<bool, DatabaseError>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError>;

    async fn find_conversation(
        &self,
        contact_id: Uuid,
        channel: Channel,
    ) -> Result<Option<Conversation>, DatabaseError>;

    /// The contact's most recently active conversation on any channel.
    async fn latest_conversation_for_contact(
        &self,
        contact_id: Uuid,
    ) -> Result<Option<Conversation>, DatabaseError>;

    async fn set_conversation_lead(
        &self,
        id: Uuid,
        lead_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Bump inbound timestamps and the unread counter.
    async fn record_conversation_inbound(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn record_conversation_outbound(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn mark_conversation_read(&self, id: Uuid, now: DateTime<Utc>)
    -> Result<(), DatabaseError>;

    /// Version-checked memory write.
    ///
    /// Succeeds only if the stored version still equals `expected_version`,
    /// in which case the version is incremented. Returns whether it applied.
    async fn update_conversation_memory(
        &self,
        id: Uuid,
        expected_version: i64,
        memory: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Conversations whose last outbound at or before `cutoff` got no reply.
    async fn list_awaiting_customer(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Conversation>, DatabaseError>;

    /// Conversations whose last inbound at or before `cutoff` got no answer.
    async fn list_unanswered_inbound(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Conversation>, DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert unless (channel, provider_message_id) already exists.
    async fn insert_message_if_absent(&self, message: &Message) -> Result<bool, DatabaseError>;

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, DatabaseError>;

    async fn get_message_by_provider_id(
        &self,
        channel: Channel,
        provider_message_id: &str,
    ) -> Result<Option<Message>, DatabaseError>;

    async fn update_message_delivery(
        &self,
        id: Uuid,
        status: DeliveryStatus,
        provider_message_id: Option<&str>,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Remove a message row outright. Only used for unsent send claims.
    async fn delete_message(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Non-failed outbound messages for the (contact, lead, channel) created
    /// at or after `since`, newest first.
    async fn recent_outbound(
        &self,
        contact_id: Uuid,
        lead_id: Option<Uuid>,
        channel: Channel,
        since: DateTime<Utc>,
    ) -> Result<Vec<Message>, DatabaseError>;

    /// Messages of a conversation in chronological order.
    async fn list_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &LeadTask) -> Result<(), DatabaseError>;

    async fn list_tasks_for_lead(&self, lead_id: Uuid) -> Result<Vec<LeadTask>, DatabaseError>;

    // ── Rules ───────────────────────────────────────────────────────

    async fn insert_rule(&self, rule: &AutomationRule) -> Result<(), DatabaseError>;

    async fn get_rule(&self, id: Uuid) -> Result<Option<AutomationRule>, DatabaseError>;

    async fn list_rules(&self) -> Result<Vec<AutomationRule>, DatabaseError>;

    async fn list_enabled_rules(&self) -> Result<Vec<AutomationRule>, DatabaseError>;

    /// Enabled scheduled rules whose `next_run_at` is at or before `now`.
    async fn list_due_scheduled_rules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AutomationRule>, DatabaseError>;

    /// Returns false if the rule does not exist.
    async fn set_rule_enabled(
        &self,
        id: Uuid,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Move `next_run_at` from `expected` to `next_run_at` and stamp
    /// `last_run_at`. Returns false when another writer moved it first.
    async fn swap_rule_schedule(
        &self,
        id: Uuid,
        expected: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // ── Rule runs ───────────────────────────────────────────────────

    async fn record_rule_run(&self, run: &RuleRun) -> Result<(), DatabaseError>;

    /// Insert `run` unless the same rule already has a cooldown-counting
    /// run for the same lead after `since`. Returns whether it was inserted.
    async fn claim_rule_run(
        &self,
        run: &RuleRun,
        since: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Settle a claimed run with its final outcome.
    async fn finish_rule_run(
        &self,
        id: Uuid,
        outcome: RunOutcome,
        detail: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Most recent FIRED or FAILED run of `rule_id` for `lead_id`.
    async fn last_rule_fire(
        &self,
        rule_id: Uuid,
        lead_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError>;

    async fn list_rule_runs(
        &self,
        rule_id: Uuid,
        limit: usize,
    ) -> Result<Vec<RuleRun>, DatabaseError>;
}
