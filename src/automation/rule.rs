//! Core types for automation rules.
//!
//! A rule pairs a trigger with a closed set of conditions and an ordered list
//! of actions. Rules are validated when saved; the engine assumes every rule
//! it loads is well formed.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RuleError;
use crate::identity::model::{Channel, LeadPriority, LeadStage};

/// A persisted automation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub trigger: RuleTrigger,
    pub conditions: Vec<Condition>,
    /// Minimum minutes between two fires of this rule for the same lead.
    pub cooldown_minutes: u32,
    pub actions: Vec<RuleAction>,

    // Scheduler state (DB-managed)
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// When a rule is considered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleTrigger {
    /// Evaluated inline when the event happens.
    Event { event: RuleEvent },
    /// Evaluated by the scheduler against the subjects the scan returns.
    Scheduled { schedule: String, scan: Scan },
}

impl RuleTrigger {
    pub fn type_tag(&self) -> &'static str {
        match self {
            RuleTrigger::Event { .. } => "EVENT",
            RuleTrigger::Scheduled { .. } => "SCHEDULED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleEvent {
    InboundMessage,
    LeadCreated,
}

/// Subject selection for scheduled rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scan {
    /// Our last outbound has gone unanswered for `hours`.
    AwaitingCustomer { hours: u32 },
    /// The customer's last inbound has gone unanswered for `hours`.
    UnansweredInbound { hours: u32 },
    /// Leads whose `next_follow_up_at` has passed.
    FollowUpDue,
    /// Leads expiring within `days`.
    ExpiringWithin { days: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Condition {
    ChannelIn { channels: Vec<Channel> },
    StageIn { stages: Vec<LeadStage> },
    /// Case-insensitive substring match on the triggering message text.
    KeywordAny { keywords: Vec<String> },
}

impl Condition {
    /// Evaluate against a subject. Keyword conditions never match without text.
    pub fn matches(&self, channel: Channel, stage: LeadStage, text: Option<&str>) -> bool {
        match self {
            Condition::ChannelIn { channels } => channels.contains(&channel),
            Condition::StageIn { stages } => stages.contains(&stage),
            Condition::KeywordAny { keywords } => match text {
                Some(text) => {
                    let lower = text.to_lowercase();
                    keywords
                        .iter()
                        .any(|k| lower.contains(&k.trim().to_lowercase()))
                }
                None => false,
            },
        }
    }
}

/// A single step in a rule's action list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleAction {
    CreateTask {
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        due_in_hours: Option<u32>,
    },
    SetPriority { priority: LeadPriority },
    SetStage { stage: LeadStage },
    AdjustScore { delta: i64 },
    ScheduleFollowUp { in_hours: u32 },
    /// Send a rendered template through the dispatcher.
    SendMessage { template: String },
    /// Re-ask the first missing question of the reply flow.
    FollowUp,
    StopAutomation,
}

impl RuleAction {
    pub fn type_tag(&self) -> &'static str {
        match self {
            RuleAction::CreateTask { .. } => "CREATE_TASK",
            RuleAction::SetPriority { .. } => "SET_PRIORITY",
            RuleAction::SetStage { .. } => "SET_STAGE",
            RuleAction::AdjustScore { .. } => "ADJUST_SCORE",
            RuleAction::ScheduleFollowUp { .. } => "SCHEDULE_FOLLOW_UP",
            RuleAction::SendMessage { .. } => "SEND_MESSAGE",
            RuleAction::FollowUp => "FOLLOW_UP",
            RuleAction::StopAutomation => "STOP_AUTOMATION",
        }
    }
}

/// Rule body as submitted by an operator.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleDraft {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub trigger: RuleTrigger,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub cooldown_minutes: u32,
    pub actions: Vec<RuleAction>,
}

fn default_enabled() -> bool {
    true
}

impl RuleDraft {
    /// Validate and build a rule, computing the first scheduled run.
    pub fn into_rule(self, now: DateTime<Utc>) -> Result<AutomationRule, RuleError> {
        let mut rule = AutomationRule {
            id: Uuid::new_v4(),
            name: self.name.trim().to_string(),
            enabled: self.enabled,
            trigger: self.trigger,
            conditions: self.conditions,
            cooldown_minutes: self.cooldown_minutes,
            actions: self.actions,
            next_run_at: None,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        };
        rule.validate()?;
        if let RuleTrigger::Scheduled { schedule, .. } = &rule.trigger {
            rule.next_run_at = next_cron_fire(schedule, now).map_err(RuleError::Invalid)?;
        }
        Ok(rule)
    }
}

impl AutomationRule {
    /// Reject malformed rules before they reach storage.
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.name.trim().is_empty() {
            return Err(RuleError::Invalid("name must not be empty".into()));
        }
        if self.actions.is_empty() {
            return Err(RuleError::Invalid("at least one action is required".into()));
        }

        if let RuleTrigger::Scheduled { schedule, scan } = &self.trigger {
            cron::Schedule::from_str(schedule)
                .map_err(|e| RuleError::Invalid(format!("invalid cron '{schedule}': {e}")))?;
            match scan {
                Scan::AwaitingCustomer { hours } | Scan::UnansweredInbound { hours }
                    if *hours == 0 =>
                {
                    return Err(RuleError::Invalid("scan hours must be > 0".into()));
                }
                Scan::ExpiringWithin { days } if *days == 0 => {
                    return Err(RuleError::Invalid("scan days must be > 0".into()));
                }
                _ => {}
            }
        }

        for condition in &self.conditions {
            match condition {
                Condition::ChannelIn { channels } if channels.is_empty() => {
                    return Err(RuleError::Invalid("CHANNEL_IN needs at least one channel".into()));
                }
                Condition::StageIn { stages } if stages.is_empty() => {
                    return Err(RuleError::Invalid("STAGE_IN needs at least one stage".into()));
                }
                Condition::KeywordAny { keywords }
                    if keywords.is_empty() || keywords.iter().any(|k| k.trim().is_empty()) =>
                {
                    return Err(RuleError::Invalid(
                        "KEYWORD_ANY needs non-blank keywords".into(),
                    ));
                }
                _ => {}
            }
        }

        for (index, action) in self.actions.iter().enumerate() {
            let problem = match action {
                RuleAction::CreateTask { title, .. } if title.trim().is_empty() => {
                    Some("task title must not be empty")
                }
                RuleAction::SendMessage { template } if template.trim().is_empty() => {
                    Some("template must not be empty")
                }
                RuleAction::ScheduleFollowUp { in_hours } if *in_hours == 0 => {
                    Some("in_hours must be > 0")
                }
                _ => None,
            };
            if let Some(problem) = problem {
                return Err(RuleError::Invalid(format!(
                    "action {index} ({}): {problem}",
                    action.type_tag()
                )));
            }
        }
        Ok(())
    }

    /// Whether all conditions hold for the subject.
    pub fn conditions_match(&self, channel: Channel, stage: LeadStage, text: Option<&str>) -> bool {
        self.conditions
            .iter()
            .all(|c| c.matches(channel, stage, text))
    }

    /// Start of the cooldown window ending at `now`.
    ///
    /// A fire strictly after this instant blocks a fire at `now`; one exactly
    /// at it has aged a full cooldown and does not.
    pub fn cooldown_since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - ChronoDuration::minutes(i64::from(self.cooldown_minutes))
    }
}

/// Outcome of one rule evaluation against one subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunOutcome {
    Fired,
    Failed,
    SkippedCooldown,
    SkippedStopped,
}

impl RunOutcome {
    pub const ALL: [RunOutcome; 4] = [
        RunOutcome::Fired,
        RunOutcome::Failed,
        RunOutcome::SkippedCooldown,
        RunOutcome::SkippedStopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Fired => "FIRED",
            RunOutcome::Failed => "FAILED",
            RunOutcome::SkippedCooldown => "SKIPPED_COOLDOWN",
            RunOutcome::SkippedStopped => "SKIPPED_STOPPED",
        }
    }

    /// Outcomes that start a cooldown window.
    pub fn counts_for_cooldown(&self) -> bool {
        matches!(self, RunOutcome::Fired | RunOutcome::Failed)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunOutcome {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FIRED" => Ok(RunOutcome::Fired),
            "FAILED" => Ok(RunOutcome::Failed),
            "SKIPPED_COOLDOWN" => Ok(RunOutcome::SkippedCooldown),
            "SKIPPED_STOPPED" => Ok(RunOutcome::SkippedStopped),
            other => Err(format!("unknown run outcome: {other}")),
        }
    }
}

/// A single logged evaluation of a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRun {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub lead_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub ran_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub detail: Option<String>,
}

/// Parse a cron expression and compute the next fire strictly after `after`.
pub fn next_cron_fire(schedule: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, String> {
    let cron_schedule =
        cron::Schedule::from_str(schedule).map_err(|e| format!("invalid cron: {e}"))?;
    Ok(cron_schedule.after(&after).next())
}

/// Fill `{name}`, `{channel}` and `{stage}` placeholders.
pub fn render_template(
    template: &str,
    name: Option<&str>,
    channel: Channel,
    stage: LeadStage,
) -> String {
    template
        .replace("{name}", name.unwrap_or("there"))
        .replace("{channel}", &channel.as_str().to_lowercase())
        .replace("{stage}", &stage.as_str().to_lowercase())
}
