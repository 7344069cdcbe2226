//! HTTP surface: provider webhooks, the operator API and media proxying.

pub mod media;
pub mod operator;
pub mod signature;
pub mod webhooks;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::automation::AutomationEngine;
use crate::channels::{ChannelRegistry, WebChatHub};
use crate::config::{PipelineConfig, WebhookSecrets};
use crate::dispatch::Dispatcher;
use crate::error::{ChannelError, DatabaseError, DispatchError, ReplyError, RuleError};
use crate::ingest::Resolver;
use crate::llm::DraftGenerator;
use crate::pipeline::InboundProcessor;
use crate::reply::{FlowCatalog, RegexFieldExtractor, ReplyEngine};
use crate::store::Database;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Database>,
    pub processor: Arc<InboundProcessor>,
    pub dispatcher: Arc<Dispatcher>,
    pub replies: Arc<ReplyEngine>,
    pub automation: Arc<AutomationEngine>,
    pub channels: ChannelRegistry,
    pub secrets: Arc<WebhookSecrets>,
}

impl AppState {
    /// Wire dispatcher, reply engine, rule engine and processor over one store.
    pub fn assemble(
        store: Arc<dyn Database>,
        channels: ChannelRegistry,
        drafter: Arc<dyn DraftGenerator>,
        flows: FlowCatalog,
        config: &PipelineConfig,
        secrets: WebhookSecrets,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), channels.clone(), config));
        let replies = Arc::new(ReplyEngine::new(
            store.clone(),
            dispatcher.clone(),
            drafter,
            Arc::new(flows),
            Arc::new(RegexFieldExtractor::default()),
            config,
        ));
        let automation = Arc::new(AutomationEngine::new(
            store.clone(),
            dispatcher.clone(),
            replies.clone(),
        ));
        let processor = Arc::new(InboundProcessor::new(
            Resolver::new(store.clone(), config.reopen_on_terminal),
            replies.clone(),
            automation.clone(),
        ));
        Self {
            store,
            processor,
            dispatcher,
            replies,
            automation,
            channels,
            secrets: Arc::new(secrets),
        }
    }
}

/// Build the full router. The web chat socket route is merged in.
pub fn router(state: AppState, webchat: &WebChatHub) -> Router {
    Router::new()
        .route("/health", get(operator::health))
        .route(
            "/webhooks/{channel}",
            post(webhooks::receive).get(webhooks::verify_subscription),
        )
        .route("/api/rules", get(operator::list_rules).post(operator::create_rule))
        .route("/api/rules/{id}/enable", post(operator::enable_rule))
        .route("/api/rules/{id}/disable", post(operator::disable_rule))
        .route("/api/rules/{id}/runs", get(operator::rule_runs))
        .route(
            "/api/conversations/{id}/stop",
            post(operator::stop_conversation).delete(operator::resume_conversation),
        )
        .route("/api/conversations/{id}/read", post(operator::mark_read))
        .route("/api/conversations/{id}/messages", get(operator::list_messages))
        .route("/api/send", post(operator::send))
        .route("/api/media/{channel}/{media_id}", get(media::fetch))
        .with_state(state)
        .merge(webchat.router())
        .layer(CorsLayer::permissive())
}

/// JSON error response for operator routes.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(e: impl std::fmt::Display) -> Self {
        error!(error = %e, "Storage failure on operator route");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal storage error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        Self::internal(e)
    }
}

impl From<RuleError> for ApiError {
    fn from(e: RuleError) -> Self {
        match e {
            RuleError::Invalid(msg) => Self::new(StatusCode::BAD_REQUEST, msg),
            RuleError::NotFound(id) => Self::not_found(format!("rule {id} not found")),
            other => Self::internal(other),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::ContactNotFound(_) => Self::not_found(e.to_string()),
            DispatchError::EmptyText => Self::new(StatusCode::BAD_REQUEST, e.to_string()),
            DispatchError::NoAddressOnChannel { .. } => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
            }
            DispatchError::Database(db) => Self::internal(db),
        }
    }
}

impl From<ReplyError> for ApiError {
    fn from(e: ReplyError) -> Self {
        match e {
            ReplyError::ConversationNotFound(_) => Self::not_found(e.to_string()),
            ReplyError::Conflict { .. } => Self::new(StatusCode::CONFLICT, e.to_string()),
            ReplyError::CorruptMemory { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            ReplyError::Dispatch(d) => d.into(),
            ReplyError::Database(db) => Self::internal(db),
        }
    }
}

impl From<ChannelError> for ApiError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::NotConfigured(_) | ChannelError::MediaNotFound { .. } => {
                Self::not_found(e.to_string())
            }
            ChannelError::Timeout { .. } => Self::new(StatusCode::GATEWAY_TIMEOUT, e.to_string()),
            other => Self::new(StatusCode::BAD_GATEWAY, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::identity::model::Channel;
    use crate::llm::TemplateDraftGenerator;
    use crate::store::LibSqlBackend;
    use crate::test_support::{RecordingSender, resolve_chat};

    async fn app() -> (Router, AppState) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let channels =
            ChannelRegistry::new().with_sender(Channel::Chat, Arc::new(RecordingSender::new()));
        let state = AppState::assemble(
            db,
            channels,
            Arc::new(TemplateDraftGenerator),
            FlowCatalog::builtin(),
            &PipelineConfig::default(),
            WebhookSecrets::default(),
        );
        (router(state.clone(), &WebChatHub::new()), state)
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let (app, _) = app().await;
        let uri = format!("/api/conversations/{}/stop", Uuid::new_v4());
        let (status, body) = call(app, "POST", &uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn stop_and_resume_round_trip() {
        let (app, state) = app().await;
        let res = resolve_chat(&state.store, "m1", "+15550001111", "hello").await;
        let uri = format!("/api/conversations/{}/stop", res.conversation.id);

        let (status, body) = call(app.clone(), "POST", &format!("{uri}?reason=needs_human")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["enabled"], true);
        assert_eq!(body["reason"], "NEEDS_HUMAN");

        let (status, body) = call(app.clone(), "DELETE", &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["enabled"], false);

        let (status, _) = call(app, "POST", &format!("{uri}?reason=bored")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn mark_read_and_list_messages() {
        let (app, state) = app().await;
        let res = resolve_chat(&state.store, "m1", "+15550001111", "hello").await;
        let id = res.conversation.id;

        let (status, _) = call(app.clone(), "POST", &format!("/api/conversations/{id}/read")).await;
        assert_eq!(status, StatusCode::OK);
        let conversation = state.store.get_conversation(id).await.unwrap().unwrap();
        assert_eq!(conversation.unread_count, 0);

        let (status, body) = call(app, "GET", &format!("/api/conversations/{id}/messages")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["body"], "hello");
    }

    #[tokio::test]
    async fn media_without_fetcher_is_not_found() {
        let (app, _) = app().await;
        let (status, _) = call(app, "GET", "/api/media/telegram/file-1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
