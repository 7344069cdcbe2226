//! Rule-based automation: event and scheduled triggers, conditions, actions.

pub mod engine;
pub mod rule;

pub use engine::{AutomationEngine, Subject, spawn_scheduler};
pub use rule::{AutomationRule, RuleAction, RuleDraft, RuleEvent, RuleRun, RuleTrigger, RunOutcome};
