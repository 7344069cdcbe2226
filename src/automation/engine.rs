//! Rule execution engine.
//!
//! Two entry points share one evaluation path:
//! - [`AutomationEngine::on_event`] is called by the pipeline for every new
//!   inbound message (and for lead creation).
//! - [`AutomationEngine::run_due`] is polled by the scheduler ticker for
//!   scheduled rules whose `next_run_at` has passed.
//!
//! Every rule that passes its conditions leaves exactly one [`RuleRun`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::automation::rule::{
    AutomationRule, RuleAction, RuleDraft, RuleEvent, RuleRun, RuleTrigger, RunOutcome, Scan,
    next_cron_fire, render_template,
};
use crate::dispatch::{Dispatcher, OutboundRequest};
use crate::error::RuleError;
use crate::identity::model::{Conversation, Lead, LeadTask, MessageOrigin};
use crate::ingest::Resolution;
use crate::reply::machine::FollowUpSkip;
use crate::reply::{FollowUpOutcome, ReplyEngine, ReplyState, StopReason};
use crate::store::Database;

/// What a rule is evaluated against.
#[derive(Debug, Clone)]
pub struct Subject {
    pub lead: Lead,
    pub conversation: Conversation,
    /// Triggering message text; `None` for scheduled scans.
    pub text: Option<String>,
}

impl Subject {
    pub fn from_resolution(resolution: &Resolution) -> Self {
        Self {
            lead: resolution.lead.clone(),
            conversation: resolution.conversation.clone(),
            text: Some(resolution.message.body.clone()),
        }
    }
}

/// What an action list did.
#[derive(Debug, Default)]
struct ActionReport {
    performed: Vec<&'static str>,
    skipped_sends: usize,
}

impl ActionReport {
    fn outcome(&self) -> RunOutcome {
        if self.performed.is_empty() && self.skipped_sends > 0 {
            RunOutcome::SkippedStopped
        } else {
            RunOutcome::Fired
        }
    }

    fn detail(&self) -> String {
        let mut detail = if self.performed.is_empty() {
            "no actions performed".to_string()
        } else {
            format!("actions: {}", self.performed.join(", "))
        };
        if self.skipped_sends > 0 {
            detail.push_str(&format!(
                "; {} send(s) skipped on stopped conversation",
                self.skipped_sends
            ));
        }
        detail
    }
}

pub struct AutomationEngine {
    store: Arc<dyn Database>,
    dispatcher: Arc<Dispatcher>,
    replies: Arc<ReplyEngine>,
}

impl AutomationEngine {
    pub fn new(
        store: Arc<dyn Database>,
        dispatcher: Arc<Dispatcher>,
        replies: Arc<ReplyEngine>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            replies,
        }
    }

    /// Validate and persist a new rule.
    pub async fn create_rule(
        &self,
        draft: RuleDraft,
        now: DateTime<Utc>,
    ) -> Result<AutomationRule, RuleError> {
        let rule = draft.into_rule(now)?;
        self.store.insert_rule(&rule).await?;
        info!(
            rule_id = %rule.id,
            name = %rule.name,
            trigger = rule.trigger.type_tag(),
            "Created automation rule"
        );
        Ok(rule)
    }

    pub async fn set_enabled(
        &self,
        id: Uuid,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<AutomationRule, RuleError> {
        if !self.store.set_rule_enabled(id, enabled, now).await? {
            return Err(RuleError::NotFound(id));
        }
        info!(rule_id = %id, enabled, "Rule toggled");
        self.store
            .get_rule(id)
            .await?
            .ok_or(RuleError::NotFound(id))
    }

    /// Evaluate every enabled rule listening for `event`.
    pub async fn on_event(
        &self,
        event: RuleEvent,
        resolution: &Resolution,
        now: DateTime<Utc>,
    ) -> Result<Vec<RuleRun>, RuleError> {
        let rules: Vec<AutomationRule> = self
            .store
            .list_enabled_rules()
            .await?
            .into_iter()
            .filter(|r| matches!(r.trigger, RuleTrigger::Event { event: e } if e == event))
            .collect();
        if rules.is_empty() {
            return Ok(Vec::new());
        }

        let subject = Subject::from_resolution(resolution);
        let mut runs = Vec::new();
        for rule in &rules {
            match self.evaluate(rule, &subject, now).await {
                Ok(Some(run)) => runs.push(run),
                Ok(None) => {}
                Err(e) => {
                    error!(rule_id = %rule.id, rule = %rule.name, error = %e, "Rule evaluation failed");
                }
            }
        }
        Ok(runs)
    }

    /// Run every scheduled rule that is due, then advance its schedule.
    /// Returns the number of runs recorded.
    ///
    /// Each rule's schedule is claimed before its scan, so two schedulers
    /// polling the same store never run the same slot twice.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<usize, RuleError> {
        let due = self.store.list_due_scheduled_rules(now).await?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!(count = due.len(), "Scheduled rules due");

        let mut recorded = 0;
        for rule in &due {
            let RuleTrigger::Scheduled { schedule, scan } = &rule.trigger else {
                continue;
            };

            let next = next_cron_fire(schedule, now).unwrap_or_else(|e| {
                warn!(rule_id = %rule.id, "Cannot compute next run: {}", e);
                None
            });
            if !self
                .store
                .swap_rule_schedule(rule.id, rule.next_run_at, next, now)
                .await?
            {
                debug!(rule_id = %rule.id, "Scheduled slot already claimed");
                continue;
            }

            let subjects = match self.scan(*scan, now).await {
                Ok(subjects) => subjects,
                Err(e) => {
                    error!(rule_id = %rule.id, error = %e, "Scan failed");
                    // Hand the slot back so the next tick retries it.
                    self.store
                        .swap_rule_schedule(rule.id, next, rule.next_run_at, now)
                        .await?;
                    continue;
                }
            };

            for subject in &subjects {
                match self.evaluate(rule, subject, now).await {
                    Ok(Some(_)) => recorded += 1,
                    Ok(None) => {}
                    Err(e) => {
                        error!(
                            rule_id = %rule.id,
                            lead_id = %subject.lead.id,
                            error = %e,
                            "Rule evaluation failed"
                        );
                    }
                }
            }

            info!(
                rule = %rule.name,
                subjects = subjects.len(),
                next_run_at = ?next,
                "Scheduled rule ran"
            );
        }
        Ok(recorded)
    }

    /// Collect the subjects a scan selects. Only open leads qualify.
    async fn scan(&self, scan: Scan, now: DateTime<Utc>) -> Result<Vec<Subject>, RuleError> {
        let mut subjects = Vec::new();
        match scan {
            Scan::AwaitingCustomer { hours } | Scan::UnansweredInbound { hours } => {
                let cutoff = now - ChronoDuration::hours(i64::from(hours));
                let conversations = if matches!(scan, Scan::AwaitingCustomer { .. }) {
                    self.store.list_awaiting_customer(cutoff).await?
                } else {
                    self.store.list_unanswered_inbound(cutoff).await?
                };
                for conversation in conversations {
                    let Some(lead_id) = conversation.lead_id else {
                        continue;
                    };
                    if let Some(lead) = self.store.get_lead(lead_id).await?
                        && lead.is_open()
                    {
                        subjects.push(Subject {
                            lead,
                            conversation,
                            text: None,
                        });
                    }
                }
            }
            Scan::FollowUpDue | Scan::ExpiringWithin { .. } => {
                let leads = match scan {
                    Scan::ExpiringWithin { days } => {
                        let until = now + ChronoDuration::days(i64::from(days));
                        self.store.list_expiring(now, until).await?
                    }
                    _ => self.store.list_follow_up_due(now).await?,
                };
                for lead in leads {
                    match self.store.latest_conversation_for_contact(lead.contact_id).await? {
                        Some(conversation) => subjects.push(Subject {
                            lead,
                            conversation,
                            text: None,
                        }),
                        None => debug!(lead_id = %lead.id, "Lead has no conversation, skipping"),
                    }
                }
            }
        }
        Ok(subjects)
    }

    /// Evaluate one rule against one subject and log the run.
    ///
    /// Returns `None` when the conditions do not match; nothing is recorded then.
    async fn evaluate(
        &self,
        rule: &AutomationRule,
        subject: &Subject,
        now: DateTime<Utc>,
    ) -> Result<Option<RuleRun>, RuleError> {
        if !rule.conditions_match(
            subject.conversation.channel,
            subject.lead.stage,
            subject.text.as_deref(),
        ) {
            return Ok(None);
        }

        // The claim row counts toward cooldown while the actions run.
        let mut run = RuleRun {
            id: Uuid::new_v4(),
            rule_id: rule.id,
            lead_id: Some(subject.lead.id),
            conversation_id: Some(subject.conversation.id),
            ran_at: now,
            outcome: RunOutcome::Fired,
            detail: None,
        };
        if !self.store.claim_rule_run(&run, rule.cooldown_since(now)).await? {
            let last_fire = self.store.last_rule_fire(rule.id, subject.lead.id).await?;
            info!(
                rule = %rule.name,
                lead_id = %subject.lead.id,
                last_fire = ?last_fire,
                "Rule in cooldown, skipping"
            );
            run.outcome = RunOutcome::SkippedCooldown;
            run.detail = last_fire.map(|at| format!("last fired at {}", at.to_rfc3339()));
            self.store.record_rule_run(&run).await?;
            return Ok(Some(run));
        }

        let (outcome, detail) = match self.execute(rule, subject, now).await {
            Ok(report) => (report.outcome(), Some(report.detail())),
            Err(e) => {
                warn!(rule = %rule.name, lead_id = %subject.lead.id, error = %e, "Rule action failed");
                (RunOutcome::Failed, Some(e.to_string()))
            }
        };
        run.outcome = outcome;
        run.detail = detail;
        self.store
            .finish_rule_run(run.id, outcome, run.detail.as_deref())
            .await?;
        debug!(rule = %rule.name, outcome = outcome.as_str(), "Rule run recorded");
        Ok(Some(run))
    }

    /// Run the action list in order. The first failure aborts the rest.
    async fn execute(
        &self,
        rule: &AutomationRule,
        subject: &Subject,
        now: DateTime<Utc>,
    ) -> Result<ActionReport, RuleError> {
        let lead_id = subject.lead.id;
        let conversation = &subject.conversation;
        let mut stage = subject.lead.stage;
        let mut report = ActionReport::default();

        for (index, action) in rule.actions.iter().enumerate() {
            let failed = |reason: String| RuleError::ActionFailed {
                index,
                action: action.type_tag().to_string(),
                reason,
            };

            match action {
                RuleAction::CreateTask {
                    title,
                    due_in_hours,
                } => {
                    let task = LeadTask {
                        id: Uuid::new_v4(),
                        lead_id,
                        rule_id: Some(rule.id),
                        title: title.clone(),
                        due_at: due_in_hours.map(|h| now + ChronoDuration::hours(i64::from(h))),
                        created_at: now,
                        completed_at: None,
                    };
                    self.store
                        .insert_task(&task)
                        .await
                        .map_err(|e| failed(e.to_string()))?;
                }
                RuleAction::SetPriority { priority } => {
                    self.store
                        .update_lead_priority(lead_id, *priority, now)
                        .await
                        .map_err(|e| failed(e.to_string()))?;
                }
                RuleAction::SetStage { stage: target } => {
                    self.store
                        .update_lead_stage(lead_id, *target, now)
                        .await
                        .map_err(|e| failed(e.to_string()))?;
                    stage = *target;
                }
                RuleAction::AdjustScore { delta } => {
                    self.store
                        .adjust_lead_score(lead_id, *delta, now)
                        .await
                        .map_err(|e| failed(e.to_string()))?;
                }
                RuleAction::ScheduleFollowUp { in_hours } => {
                    let at = now + ChronoDuration::hours(i64::from(*in_hours));
                    self.store
                        .set_lead_follow_up(lead_id, Some(at), now)
                        .await
                        .map_err(|e| failed(e.to_string()))?;
                }
                RuleAction::SendMessage { template } => {
                    let state = self
                        .replies
                        .load_state(conversation.id)
                        .await
                        .map_err(|e| failed(e.to_string()))?;
                    if state.is_stopped() {
                        report.skipped_sends += 1;
                        continue;
                    }
                    let name = self
                        .contact_name(conversation, &state)
                        .await
                        .map_err(|e| failed(e.to_string()))?;
                    let text = render_template(template, name.as_deref(), conversation.channel, stage);
                    let outcome = self
                        .dispatcher
                        .send_at(
                            OutboundRequest {
                                contact_id: conversation.contact_id,
                                lead_id: Some(lead_id),
                                channel: conversation.channel,
                                text,
                                origin: MessageOrigin::Automation,
                                reply_key: None,
                            },
                            now,
                        )
                        .await
                        .map_err(|e| failed(e.to_string()))?;
                    if !outcome.is_success() {
                        return Err(failed(
                            outcome.error.unwrap_or_else(|| "send not delivered".into()),
                        ));
                    }
                }
                RuleAction::FollowUp => {
                    let outcome = self
                        .replies
                        .follow_up_at(conversation.id, now)
                        .await
                        .map_err(|e| failed(e.to_string()))?;
                    match outcome {
                        FollowUpOutcome::Skipped(FollowUpSkip::Stopped) => {
                            report.skipped_sends += 1;
                            continue;
                        }
                        FollowUpOutcome::Skipped(skip) => {
                            debug!(rule = %rule.name, reason = skip.as_str(), "Nothing to follow up");
                        }
                        FollowUpOutcome::Sent { dispatch, .. } if !dispatch.is_success() => {
                            return Err(failed(
                                dispatch.error.unwrap_or_else(|| "send not delivered".into()),
                            ));
                        }
                        FollowUpOutcome::Sent { .. } => {}
                    }
                }
                RuleAction::StopAutomation => {
                    self.replies
                        .stop(conversation.id, StopReason::Rule, now)
                        .await
                        .map_err(|e| failed(e.to_string()))?;
                }
            }
            report.performed.push(action.type_tag());
        }
        Ok(report)
    }

    /// Name for templates: the collected name, else the contact's profile name.
    async fn contact_name(
        &self,
        conversation: &Conversation,
        state: &ReplyState,
    ) -> Result<Option<String>, RuleError> {
        if let Some(field) = state.collected.get("name") {
            return Ok(Some(field.value.clone()));
        }
        Ok(self
            .store
            .get_contact(conversation.contact_id)
            .await?
            .and_then(|c| c.display_name))
    }
}

/// Spawn the scheduler ticker that polls for due scheduled rules.
pub fn spawn_scheduler(
    engine: Arc<AutomationEngine>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = engine.run_due(Utc::now()).await {
                error!("Scheduler tick failed: {}", e);
            }
        }
    })
}
