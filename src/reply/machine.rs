//! Pure reply state transitions and reply planning.
//!
//! Nothing here touches storage. The engine loads a [`ReplyState`], applies
//! these functions, and persists the result with a version-checked write.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::reply::extract::{Candidate, FieldExtractor};
use crate::reply::flows::{Flow, FlowCatalog};
use crate::reply::state::{CollectedField, ReplyStage, ReplyState, StopReason};

/// Question key of the confirmation summary.
pub const CONFIRM_KEY: &str = "__confirm__";
/// Question key of the closing acknowledgement.
pub const DONE_KEY: &str = "__done__";

const OPT_OUT_EXACT: &[&str] = &["stop", "stop all", "unsubscribe", "cancel", "quit", "end"];
const OPT_OUT_PHRASES: &[&str] = &[
    "unsubscribe",
    "opt out",
    "opt-out",
    "do not contact",
    "don't contact",
    "stop messaging",
    "stop texting",
    "stop contacting",
];

const AFFIRMATIVE: &[&str] = &[
    "yes", "y", "yep", "yeah", "yup", "correct", "right", "confirm", "confirmed", "ok", "okay",
    "sure", "exactly", "perfect", "si", "sí",
];
const NEGATIVE: &[&str] = &["no", "n", "nope", "wrong", "incorrect", "nah"];

/// What an inbound message did to the state.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The message id was already processed; nothing changed.
    Replayed,
    /// The customer asked to stop.
    OptedOut,
    Applied {
        from: ReplyStage,
        to: ReplyStage,
        /// Fields whose stored value changed.
        captured: Vec<String>,
    },
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Replayed => "replayed",
            Transition::OptedOut => "opted_out",
            Transition::Applied { .. } => "applied",
        }
    }
}

/// A reply the machine wants sent.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedReply {
    pub question_key: String,
    /// Deterministic text; the draft generator may rephrase it.
    pub fallback_text: String,
    pub reply_key: String,
}

/// Why a follow-up was not planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUpSkip {
    Stopped,
    Done,
    Exhausted,
    NothingToAsk,
}

impl FollowUpSkip {
    pub fn as_str(&self) -> &'static str {
        match self {
            FollowUpSkip::Stopped => "stopped",
            FollowUpSkip::Done => "done",
            FollowUpSkip::Exhausted => "follow_ups_exhausted",
            FollowUpSkip::NothingToAsk => "nothing_to_ask",
        }
    }
}

/// `hex(sha256(conversation_id | question_key | follow_up_step))`.
pub fn reply_key(conversation_id: Uuid, question_key: &str, follow_up_step: u32) -> String {
    let input = format!("{conversation_id}|{question_key}|{follow_up_step}");
    hex::encode(Sha256::digest(input.as_bytes()))
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '\'' || c == '-'))
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn is_opt_out(text: &str) -> bool {
    let joined = words(text).join(" ");
    OPT_OUT_EXACT.contains(&joined.as_str()) || OPT_OUT_PHRASES.iter().any(|p| joined.contains(p))
}

pub fn is_affirmative(text: &str) -> bool {
    let joined = words(text).join(" ");
    words(text)
        .first()
        .is_some_and(|w| AFFIRMATIVE.contains(&w.as_str()))
        || joined.contains("that's right")
        || joined.contains("sounds good")
        || joined.contains("all good")
}

pub fn is_negative(text: &str) -> bool {
    let joined = words(text).join(" ");
    words(text)
        .first()
        .is_some_and(|w| NEGATIVE.contains(&w.as_str()))
        || joined.contains("not right")
        || joined.contains("not correct")
}

/// Merge candidates into `collected`.
///
/// A confirmed value is only replaced by a strictly more confident one; an
/// unconfirmed value is replaced by an equal or more confident one.
/// Returns the fields whose value changed.
pub fn merge_candidates(state: &mut ReplyState, candidates: Vec<Candidate>) -> Vec<String> {
    let mut changed = Vec::new();
    for candidate in candidates {
        let replace = match state.collected.get(&candidate.field) {
            None => true,
            Some(existing) if existing.confirmed => candidate.confidence > existing.confidence,
            Some(existing) => candidate.confidence >= existing.confidence,
        };
        if !replace {
            continue;
        }
        let same_value = state
            .collected
            .get(&candidate.field)
            .is_some_and(|e| e.value == candidate.value);
        state.collected.insert(
            candidate.field.clone(),
            CollectedField {
                value: candidate.value,
                confidence: candidate.confidence,
                confirmed: false,
            },
        );
        if !same_value {
            changed.push(candidate.field);
        }
    }
    changed
}

/// Apply one inbound message.
pub fn apply_inbound(
    state: &mut ReplyState,
    catalog: &FlowCatalog,
    extractor: &dyn FieldExtractor,
    inbound_id: &str,
    text: &str,
    now: DateTime<Utc>,
) -> Transition {
    if state.has_processed(inbound_id) {
        return Transition::Replayed;
    }
    state.record_processed(inbound_id);

    if is_opt_out(text) {
        state.stop(StopReason::OptOut, now);
        return Transition::OptedOut;
    }

    if state.service_key.is_none() {
        let flow = catalog.select(text);
        state.service_key = Some(flow.key.clone());
        state.set_required(&flow.required);
    }

    let from = state.stage;
    let captured = match state.stage {
        ReplyStage::Collecting => {
            let fields = state.missing.clone();
            let candidates = extractor.extract(text, &fields, state.next_question_key.as_deref());
            let captured = merge_candidates(state, candidates);
            state.recompute_missing();
            if state.missing.is_empty() {
                state.stage = ReplyStage::Confirming;
            }
            captured
        }
        ReplyStage::Confirming if is_affirmative(text) => {
            for field in state.collected.values_mut() {
                field.confirmed = true;
            }
            state.stage = ReplyStage::Done;
            Vec::new()
        }
        ReplyStage::Confirming if is_negative(text) => {
            state.stop(StopReason::NeedsHuman, now);
            Vec::new()
        }
        ReplyStage::Confirming => {
            // Corrections: re-summarize when a value changed.
            let fields = state.required.clone();
            let candidates = extractor.extract(text, &fields, None);
            let captured = merge_candidates(state, candidates);
            if !captured.is_empty() {
                state.asked_question_keys.retain(|k| k != CONFIRM_KEY);
            }
            captured
        }
        ReplyStage::Done => Vec::new(),
    };

    Transition::Applied {
        from,
        to: state.stage,
        captured,
    }
}

fn plan(state: &mut ReplyState, conversation_id: Uuid, key: &str, text: String) -> PlannedReply {
    state.mark_asked(key);
    let reply_key = reply_key(conversation_id, key, state.follow_up_step);
    state.last_reply_key = Some(reply_key.clone());
    PlannedReply {
        question_key: key.to_string(),
        fallback_text: text,
        reply_key,
    }
}

fn first_unasked_missing(state: &ReplyState) -> Option<String> {
    state
        .missing
        .iter()
        .find(|f| !state.has_asked(f))
        .cloned()
}

/// Decide the next automated reply, marking it asked.
pub fn plan_reply(state: &mut ReplyState, flow: &Flow, conversation_id: Uuid) -> Option<PlannedReply> {
    if state.is_stopped() {
        return None;
    }

    match state.stage {
        ReplyStage::Collecting => {
            state.next_question_key = first_unasked_missing(state);
            let key = state.next_question_key.clone()?;
            let text = flow.question(&key);
            Some(plan(state, conversation_id, &key, text))
        }
        ReplyStage::Confirming => {
            state.next_question_key = None;
            if state.has_asked(CONFIRM_KEY) {
                return None;
            }
            let text = flow.confirmation(&state.collected_pairs());
            Some(plan(state, conversation_id, CONFIRM_KEY, text))
        }
        ReplyStage::Done => {
            state.next_question_key = None;
            if state.has_asked(DONE_KEY) {
                return None;
            }
            let text = flow.done_template.clone();
            Some(plan(state, conversation_id, DONE_KEY, text))
        }
    }
}

/// Advance the follow-up step and re-ask the outstanding question.
pub fn plan_follow_up(
    state: &mut ReplyState,
    flow: &Flow,
    conversation_id: Uuid,
    max_follow_ups: u32,
) -> Result<PlannedReply, FollowUpSkip> {
    if state.is_stopped() {
        return Err(FollowUpSkip::Stopped);
    }
    if state.stage == ReplyStage::Done {
        return Err(FollowUpSkip::Done);
    }
    if state.follow_up_step >= max_follow_ups {
        return Err(FollowUpSkip::Exhausted);
    }

    let (key, text) = match state.stage {
        ReplyStage::Confirming => (
            CONFIRM_KEY.to_string(),
            flow.confirmation(&state.collected_pairs()),
        ),
        _ => {
            let key = state
                .missing
                .first()
                .cloned()
                .ok_or(FollowUpSkip::NothingToAsk)?;
            let text = flow.question(&key);
            (key, text)
        }
    };

    state.follow_up_step += 1;
    state.next_question_key = (key != CONFIRM_KEY).then(|| key.clone());
    Ok(plan(state, conversation_id, &key, text))
}
