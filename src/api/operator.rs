//! Operator REST endpoints: rules, conversation control and manual sends.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::automation::RuleDraft;
use crate::dispatch::OutboundRequest;
use crate::identity::model::{Channel, MessageOrigin};
use crate::reply::StopReason;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    limit: Option<usize>,
}

impl LimitParams {
    fn resolve(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

// ── Health ──────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "leadline"
    }))
}

// ── Rules ───────────────────────────────────────────────────────────────

pub async fn list_rules(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.list_rules().await?))
}

pub async fn create_rule(
    State(state): State<AppState>,
    Json(draft): Json<RuleDraft>,
) -> Result<impl IntoResponse, ApiError> {
    let rule = state.automation.create_rule(draft, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn enable_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.automation.set_enabled(id, true, Utc::now()).await?))
}

pub async fn disable_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.automation.set_enabled(id, false, Utc::now()).await?))
}

pub async fn rule_runs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<LimitParams>,
) -> Result<impl IntoResponse, ApiError> {
    if state.store.get_rule(id).await?.is_none() {
        return Err(ApiError::not_found(format!("rule {id} not found")));
    }
    Ok(Json(state.store.list_rule_runs(id, params.resolve()).await?))
}

// ── Conversations ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StopParams {
    reason: Option<String>,
}

/// Stop automation. `?reason=` defaults to `OPERATOR`.
pub async fn stop_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<StopParams>,
) -> Result<impl IntoResponse, ApiError> {
    let reason = match params.reason.as_deref() {
        Some(raw) => raw
            .parse::<StopReason>()
            .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e))?,
        None => StopReason::Operator,
    };
    let reply_state = state.replies.stop(id, reason, Utc::now()).await?;
    Ok(Json(reply_state.stop))
}

pub async fn resume_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let reply_state = state.replies.clear_stop(id, Utc::now()).await?;
    Ok(Json(reply_state.stop))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    if state.store.get_conversation(id).await?.is_none() {
        return Err(ApiError::not_found(format!("conversation {id} not found")));
    }
    state.store.mark_conversation_read(id, Utc::now()).await?;
    Ok(Json(serde_json::json!({ "status": "read" })))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<LimitParams>,
) -> Result<impl IntoResponse, ApiError> {
    if state.store.get_conversation(id).await?.is_none() {
        return Err(ApiError::not_found(format!("conversation {id} not found")));
    }
    Ok(Json(state.store.list_messages(id, params.resolve()).await?))
}

// ── Manual send ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub contact_id: Uuid,
    pub channel: Channel,
    pub text: String,
    #[serde(default)]
    pub lead_id: Option<Uuid>,
}

/// Send through the dispatcher. A suppressed duplicate is still a `200`;
/// a failed provider call is a `502` carrying the outcome.
pub async fn send(
    State(state): State<AppState>,
    Json(body): Json<SendRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .dispatcher
        .send(OutboundRequest {
            contact_id: body.contact_id,
            lead_id: body.lead_id,
            channel: body.channel,
            text: body.text,
            origin: MessageOrigin::Operator,
            reply_key: None,
        })
        .await?;
    let status = if outcome.is_success() {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    Ok((status, Json(outcome)))
}
