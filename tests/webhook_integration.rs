//! Integration tests for the webhook and operator HTTP surface.
//!
//! Each test spins up the full Axum router on a random port over an
//! in-memory database and drives it with reqwest (and tokio-tungstenite for
//! the web chat socket).

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use leadline::api::{self, AppState, signature};
use leadline::channels::{ChannelRegistry, WebChatHub};
use leadline::config::{PipelineConfig, WebhookSecrets};
use leadline::identity::model::Channel;
use leadline::llm::TemplateDraftGenerator;
use leadline::reply::FlowCatalog;
use leadline::store::{Database, LibSqlBackend};

/// Maximum time any test is allowed to wait on the server.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const CHAT_SECRET: &str = "s3cret";
const VERIFY_TOKEN: &str = "verify-me";

struct TestServer {
    base: String,
    port: u16,
    db: Arc<dyn Database>,
    client: reqwest::Client,
}

/// Start the router on a random port.
async fn start_server() -> TestServer {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let webchat = WebChatHub::new();
    let channels =
        ChannelRegistry::new().with_sender(Channel::WebChat, Arc::new(webchat.clone()));

    let mut secrets = WebhookSecrets::default().with_secret(Channel::Chat, CHAT_SECRET);
    secrets.verify_token = Some(SecretString::from(VERIFY_TOKEN.to_string()));

    let state = AppState::assemble(
        db.clone(),
        channels,
        Arc::new(TemplateDraftGenerator),
        FlowCatalog::builtin(),
        &PipelineConfig::default(),
        secrets,
    );
    let app = api::router(state, &webchat);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        base: format!("http://127.0.0.1:{port}"),
        port,
        db,
        client: reqwest::Client::new(),
    }
}

fn whatsapp_body(id: &str, text: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "entry": [{
            "changes": [{
                "value": {
                    "contacts": [{ "wa_id": "15550001111", "profile": { "name": "John" } }],
                    "messages": [{
                        "id": id,
                        "from": "15550001111",
                        "type": "text",
                        "text": { "body": text }
                    }]
                }
            }]
        }]
    }))
    .unwrap()
}

impl TestServer {
    async fn post_signed(&self, channel: &str, body: Vec<u8>, secret: &str) -> reqwest::Response {
        let sig = signature::sign(secret, &body).unwrap();
        self.client
            .post(format!("{}/webhooks/{channel}", self.base))
            .header("content-type", "application/json")
            .header(signature::HUB_SIGNATURE_HEADER, sig)
            .body(body)
            .send()
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn health_responds() {
    let server = start_server().await;
    let body: Value = server
        .client
        .get(format!("{}/health", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn bad_signature_is_rejected() {
    let server = start_server().await;
    let resp = server
        .post_signed("chat", whatsapp_body("wamid.1", "hello"), "wrong")
        .await;
    assert_eq!(resp.status(), 401);

    let unsigned = server
        .client
        .post(format!("{}/webhooks/chat", server.base))
        .body(whatsapp_body("wamid.1", "hello"))
        .send()
        .await
        .unwrap();
    assert_eq!(unsigned.status(), 401);
}

#[tokio::test]
async fn redelivery_is_acknowledged_as_duplicate() {
    let server = start_server().await;

    let first: Value = server
        .post_signed("chat", whatsapp_body("wamid.1", "hello"), CHAT_SECRET)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(first["received"], 1);
    assert_eq!(first["duplicates"], 0);

    let again: Value = server
        .post_signed("chat", whatsapp_body("wamid.1", "hello"), CHAT_SECRET)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(again["received"], 0);
    assert_eq!(again["duplicates"], 1);

    let contact = server
        .db
        .get_contact_by_address("+15550001111")
        .await
        .unwrap()
        .expect("contact created once");
    assert_eq!(contact.display_name.as_deref(), Some("John"));
}

#[tokio::test]
async fn malformed_and_unknown_deliveries() {
    let server = start_server().await;

    let resp = server.post_signed("chat", b"not json".to_vec(), CHAT_SECRET).await;
    assert_eq!(resp.status(), 200);

    let resp = server
        .client
        .post(format!("{}/webhooks/fax", server.base))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn subscription_challenge() {
    let server = start_server().await;
    let url = format!("{}/webhooks/chat", server.base);

    let ok = server
        .client
        .get(&url)
        .query(&[
            ("hub.mode", "subscribe"),
            ("hub.verify_token", VERIFY_TOKEN),
            ("hub.challenge", "12345"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);
    assert_eq!(ok.text().await.unwrap(), "12345");

    let denied = server
        .client
        .get(&url)
        .query(&[
            ("hub.mode", "subscribe"),
            ("hub.verify_token", "nope"),
            ("hub.challenge", "12345"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 403);
}

#[tokio::test]
async fn web_chat_visitor_gets_first_question() {
    let server = start_server().await;
    let (mut socket, _) = connect_async(format!(
        "ws://127.0.0.1:{}/ws/webchat?visitor_id=v1",
        server.port
    ))
    .await
    .unwrap();
    // Let the hub register the visitor.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let resp = server
        .client
        .post(format!("{}/webhooks/web_chat", server.base))
        .json(&json!({ "visitor_id": "v1", "text": "hello there", "message_id": "w1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let pushed = timeout(TEST_TIMEOUT, async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<Value>(&text).unwrap();
                }
                Some(Ok(_)) => continue,
                other => panic!("socket closed: {other:?}"),
            }
        }
    })
    .await
    .expect("no push within timeout");

    assert_eq!(pushed["visitor_id"], "v1");
    assert_eq!(
        pushed["text"],
        "Hi! Thanks for reaching out. May I have your name?"
    );
}

#[tokio::test]
async fn rule_lifecycle_over_http() {
    let server = start_server().await;
    let rules_url = format!("{}/api/rules", server.base);

    let invalid = server
        .client
        .post(&rules_url)
        .json(&json!({
            "name": "empty",
            "trigger": { "kind": "EVENT", "event": "INBOUND_MESSAGE" },
            "actions": []
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), 400);

    let created = server
        .client
        .post(&rules_url)
        .json(&json!({
            "name": "hot lead",
            "trigger": { "kind": "EVENT", "event": "INBOUND_MESSAGE" },
            "conditions": [{ "type": "KEYWORD_ANY", "keywords": ["urgent"] }],
            "cooldown_minutes": 60,
            "actions": [{ "type": "SET_PRIORITY", "priority": "URGENT" }]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    let rule: Value = created.json().await.unwrap();
    let id = rule["id"].as_str().unwrap().to_string();

    let listed: Value = server.client.get(&rules_url).send().await.unwrap().json().await.unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let disabled: Value = server
        .client
        .post(format!("{rules_url}/{id}/disable"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(disabled["enabled"], false);

    let runs = server
        .client
        .get(format!("{rules_url}/{id}/runs"))
        .send()
        .await
        .unwrap();
    assert_eq!(runs.status(), 200);

    let missing = server
        .client
        .post(format!("{rules_url}/{}/enable", uuid::Uuid::new_v4()))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn manual_send_to_unknown_contact_is_not_found() {
    let server = start_server().await;
    let resp = server
        .client
        .post(format!("{}/api/send", server.base))
        .json(&json!({
            "contact_id": uuid::Uuid::new_v4(),
            "channel": "WEB_CHAT",
            "text": "hello"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
