//! Reply state persisted in a conversation's automation memory.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How many recent inbound ids are remembered for replay detection.
pub const PROCESSED_RING_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyStage {
    #[default]
    Collecting,
    Confirming,
    Done,
}

impl ReplyStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyStage::Collecting => "COLLECTING",
            ReplyStage::Confirming => "CONFIRMING",
            ReplyStage::Done => "DONE",
        }
    }
}

/// Why automation was stopped for a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    Operator,
    OptOut,
    NeedsHuman,
    Rule,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Operator => "OPERATOR",
            StopReason::OptOut => "OPT_OUT",
            StopReason::NeedsHuman => "NEEDS_HUMAN",
            StopReason::Rule => "RULE",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StopReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OPERATOR" => Ok(StopReason::Operator),
            "OPT_OUT" => Ok(StopReason::OptOut),
            "NEEDS_HUMAN" => Ok(StopReason::NeedsHuman),
            "RULE" => Ok(StopReason::Rule),
            other => Err(format!("unknown stop reason: {other}")),
        }
    }
}

/// Sticky stop flag. Only an operator clears it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopFlag {
    pub enabled: bool,
    pub reason: Option<StopReason>,
    pub at: Option<DateTime<Utc>>,
}

/// One collected field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectedField {
    pub value: String,
    pub confidence: f32,
    pub confirmed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyState {
    /// Flow in use; chosen on the first inbound message.
    pub service_key: Option<String>,
    pub stage: ReplyStage,
    pub collected: BTreeMap<String, CollectedField>,
    pub required: Vec<String>,
    /// Required fields not yet collected, in flow order.
    pub missing: Vec<String>,
    pub next_question_key: Option<String>,
    pub asked_question_keys: Vec<String>,
    pub follow_up_step: u32,
    pub last_inbound_message_id: Option<String>,
    pub processed_inbound_ids: VecDeque<String>,
    pub last_reply_key: Option<String>,
    pub stop: StopFlag,
}

impl ReplyState {
    /// Decode conversation memory. Empty memory is a fresh state; an
    /// unreadable blob is an error, since it may hold a stop flag.
    pub fn from_memory(memory: &serde_json::Value) -> Result<Self, serde_json::Error> {
        let empty = memory.is_null() || memory.as_object().is_some_and(|o| o.is_empty());
        if empty {
            return Ok(Self::default());
        }
        serde_json::from_value(memory.clone())
    }

    pub fn to_memory(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }

    pub fn has_processed(&self, inbound_id: &str) -> bool {
        self.processed_inbound_ids.iter().any(|id| id == inbound_id)
    }

    /// Remember an inbound id, evicting the oldest past the ring size.
    pub fn record_processed(&mut self, inbound_id: &str) {
        if !self.has_processed(inbound_id) {
            self.processed_inbound_ids.push_back(inbound_id.to_string());
            while self.processed_inbound_ids.len() > PROCESSED_RING_SIZE {
                self.processed_inbound_ids.pop_front();
            }
        }
        self.last_inbound_message_id = Some(inbound_id.to_string());
    }

    pub fn has_asked(&self, key: &str) -> bool {
        self.asked_question_keys.iter().any(|k| k == key)
    }

    pub fn mark_asked(&mut self, key: &str) {
        if !self.has_asked(key) {
            self.asked_question_keys.push(key.to_string());
        }
    }

    /// Set `required` and recompute `missing`.
    pub fn set_required(&mut self, required: &[String]) {
        self.required = required.to_vec();
        self.recompute_missing();
    }

    pub fn recompute_missing(&mut self) {
        self.missing = self
            .required
            .iter()
            .filter(|f| !self.collected.contains_key(*f))
            .cloned()
            .collect();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.enabled
    }

    /// Set the stop flag. An existing stop keeps its original reason.
    pub fn stop(&mut self, reason: StopReason, at: DateTime<Utc>) {
        if self.is_stopped() {
            return;
        }
        self.stop = StopFlag {
            enabled: true,
            reason: Some(reason),
            at: Some(at),
        };
    }

    pub fn clear_stop(&mut self) {
        self.stop = StopFlag::default();
    }

    /// Collected values as `(field, value)` pairs in required-field order,
    /// then any extras.
    pub fn collected_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .required
            .iter()
            .filter_map(|f| self.collected.get(f).map(|c| (f.clone(), c.value.clone())))
            .collect();
        for (field, c) in &self.collected {
            if !self.required.contains(field) {
                pairs.push((field.clone(), c.value.clone()));
            }
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_memory_is_fresh_state() {
        assert_eq!(ReplyState::from_memory(&json!({})).unwrap(), ReplyState::default());
        assert_eq!(ReplyState::from_memory(&json!(null)).unwrap(), ReplyState::default());
    }

    #[test]
    fn unreadable_memory_is_an_error() {
        assert!(ReplyState::from_memory(&json!({ "stage": "SIDEWAYS" })).is_err());
        assert!(
            ReplyState::from_memory(&json!({ "stop": { "enabled": true, "reason": "LEGAL_HOLD" } }))
                .is_err()
        );
    }

    #[test]
    fn memory_roundtrip_keeps_stop_flag() {
        let mut state = ReplyState::default();
        state.stop(StopReason::OptOut, Utc::now());
        state.mark_asked("name");
        let back = ReplyState::from_memory(&state.to_memory()).unwrap();
        assert_eq!(back, state);
        assert_eq!(state.to_memory()["stop"]["reason"], "OPT_OUT");
    }

    #[test]
    fn processed_ring_is_bounded() {
        let mut state = ReplyState::default();
        for i in 0..(PROCESSED_RING_SIZE + 5) {
            state.record_processed(&format!("m{i}"));
        }
        assert_eq!(state.processed_inbound_ids.len(), PROCESSED_RING_SIZE);
        assert!(!state.has_processed("m0"));
        assert!(state.has_processed(&format!("m{}", PROCESSED_RING_SIZE + 4)));
    }

    #[test]
    fn missing_follows_required_order() {
        let mut state = ReplyState::default();
        state.collected.insert(
            "name".into(),
            CollectedField {
                value: "Ana".into(),
                confidence: 0.9,
                confirmed: false,
            },
        );
        state.set_required(&["name".into(), "service".into(), "email".into()]);
        assert_eq!(state.missing, vec!["service", "email"]);
    }
}
