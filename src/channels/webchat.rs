//! Web chat push: delivers outbound messages to connected widget sockets.
//!
//! Visitors connect to `/ws/webchat?visitor_id=...` and receive only their
//! own messages. Visitor text comes in through the regular webhook route.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::{ChannelSender, DeliveryReceipt, OutboundPayload};
use crate::error::ChannelError;

const NAME: &str = "webchat";

/// Message from server to widget.
#[derive(Debug, Clone, Serialize)]
struct PushMessage {
    visitor_id: String,
    message_id: String,
    text: String,
}

struct HubInner {
    outgoing_tx: broadcast::Sender<PushMessage>,
    /// Open sockets per visitor.
    connected: Mutex<HashMap<String, usize>>,
}

/// Broadcast hub shared by the sender and the WebSocket handlers.
#[derive(Clone)]
pub struct WebChatHub {
    inner: Arc<HubInner>,
}

impl Default for WebChatHub {
    fn default() -> Self {
        Self::new()
    }
}

impl WebChatHub {
    pub fn new() -> Self {
        let (outgoing_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(HubInner {
                outgoing_tx,
                connected: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Router with the `/ws/webchat` endpoint; merge into the main app.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws/webchat", get(ws_webchat_handler))
            .with_state(self.clone())
    }

    pub async fn is_connected(&self, visitor_id: &str) -> bool {
        self.inner
            .connected
            .lock()
            .await
            .get(visitor_id)
            .is_some_and(|n| *n > 0)
    }

    async fn register(&self, visitor_id: &str) {
        *self
            .inner
            .connected
            .lock()
            .await
            .entry(visitor_id.to_string())
            .or_default() += 1;
    }

    async fn unregister(&self, visitor_id: &str) {
        let mut connected = self.inner.connected.lock().await;
        if let Some(count) = connected.get_mut(visitor_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                connected.remove(visitor_id);
            }
        }
    }
}

#[async_trait]
impl ChannelSender for WebChatHub {
    fn name(&self) -> &str {
        NAME
    }

    async fn send(
        &self,
        address: &str,
        payload: &OutboundPayload,
    ) -> Result<DeliveryReceipt, ChannelError> {
        if !self.is_connected(address).await {
            return Err(ChannelError::SendFailed {
                name: NAME.into(),
                reason: format!("visitor {address} is not connected"),
            });
        }

        let message_id = format!("web-{}", Uuid::new_v4());
        let push = PushMessage {
            visitor_id: address.to_string(),
            message_id: message_id.clone(),
            text: payload.text.clone(),
        };
        self.inner
            .outgoing_tx
            .send(push)
            .map_err(|_| ChannelError::SendFailed {
                name: NAME.into(),
                reason: "no open web chat sockets".into(),
            })?;

        Ok(DeliveryReceipt::sent(message_id))
    }
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    visitor_id: String,
}

async fn ws_webchat_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(hub): State<WebChatHub>,
) -> impl IntoResponse {
    info!(visitor_id = %params.visitor_id, "Web chat client connecting");
    ws.on_upgrade(move |socket| handle_webchat_socket(socket, hub, params.visitor_id))
}

async fn handle_webchat_socket(mut socket: WebSocket, hub: WebChatHub, visitor_id: String) {
    // Subscribe before registering so no push for this visitor is missed.
    let mut outgoing_rx = hub.inner.outgoing_tx.subscribe();
    hub.register(&visitor_id).await;

    loop {
        tokio::select! {
            result = outgoing_rx.recv() => {
                match result {
                    Ok(msg) if msg.visitor_id == visitor_id => {
                        if let Ok(json) = serde_json::to_string(&msg)
                            && socket.send(Message::Text(json.into())).await.is_err()
                        {
                            debug!(visitor_id = %visitor_id, "Web chat client disconnected during send");
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, visitor_id = %visitor_id, "Web chat client lagged behind broadcast");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "Web chat WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    hub.unregister(&visitor_id).await;
    info!(visitor_id = %visitor_id, "Web chat connection closed");
}
