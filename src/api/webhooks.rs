//! Provider webhook endpoints.
//!
//! Deliveries are answered with `200` even when processing fails, so
//! providers do not redeliver into a broken pipeline. Only a bad signature
//! gets `401`.

use std::collections::HashMap;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use secrecy::ExposeSecret;
use serde_json::json;
use tracing::{error, info, warn};

use super::AppState;
use super::signature::verify_delivery;
use crate::error::IngestError;
use crate::identity::model::Channel;

/// `POST /webhooks/{channel}`
pub async fn receive(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(channel) = channel.parse::<Channel>() else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown channel '{channel}'") })),
        )
            .into_response();
    };

    if let Err(e) = verify_delivery(channel, &state.secrets, &headers, &body) {
        warn!(channel = channel.as_str(), "Webhook signature rejected");
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": e.to_string() }))).into_response();
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(channel = channel.as_str(), error = %e, "Webhook body is not JSON, ignoring");
            return accepted(0, 0);
        }
    };

    match state.processor.process(channel, &payload, Utc::now()).await {
        Ok(resolutions) => {
            let duplicates = resolutions.iter().filter(|r| r.was_duplicate).count();
            accepted(resolutions.len() - duplicates, duplicates)
        }
        Err(e @ IngestError::Malformed { .. }) => {
            warn!(channel = channel.as_str(), error = %e, "Malformed webhook payload");
            accepted(0, 0)
        }
        Err(e) => {
            error!(channel = channel.as_str(), error = %e, "Webhook processing failed");
            accepted(0, 0)
        }
    }
}

fn accepted(received: usize, duplicates: usize) -> Response {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "received": received, "duplicates": duplicates })),
    )
        .into_response()
}

/// `GET /webhooks/{channel}`: answers the `hub.mode=subscribe` challenge.
pub async fn verify_subscription(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mode = params.get("hub.mode").map(String::as_str);
    let token = params.get("hub.verify_token").map(String::as_str);
    let challenge = params.get("hub.challenge");

    let expected = state.secrets.verify_token.as_ref().map(|t| t.expose_secret());
    match (mode, token, expected, challenge) {
        (Some("subscribe"), Some(token), Some(expected), Some(challenge)) if token == expected => {
            info!(channel = %channel, "Webhook subscription verified");
            (StatusCode::OK, challenge.clone()).into_response()
        }
        _ => {
            warn!(channel = %channel, "Webhook subscription verification failed");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}
