//! Shared test doubles.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use crate::channels::{ChannelSender, DeliveryReceipt, OutboundPayload};
use crate::error::ChannelError;
use crate::identity::model::Channel;
use crate::ingest::{Resolution, Resolver, normalize};
use crate::store::Database;

#[derive(Debug, Clone, Copy)]
enum Mode {
    Deliver,
    Delay(Duration),
    Fail,
    Hang,
}

/// Channel sender that records what it was asked to send.
pub(crate) struct RecordingSender {
    mode: Mode,
    sent: Mutex<Vec<(String, String)>>,
    attempts: AtomicUsize,
}

impl RecordingSender {
    pub(crate) fn new() -> Self {
        Self::with_mode(Mode::Deliver)
    }

    /// Every send is delivered after `delay`.
    pub(crate) fn delayed(delay: Duration) -> Self {
        Self::with_mode(Mode::Delay(delay))
    }

    /// Every send fails with a provider error.
    pub(crate) fn failing() -> Self {
        Self::with_mode(Mode::Fail)
    }

    /// Every send hangs until the dispatcher times out.
    pub(crate) fn hanging() -> Self {
        Self::with_mode(Mode::Hang)
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            sent: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Delivered `(address, text)` pairs in order.
    pub(crate) fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, text)| text).collect()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelSender for RecordingSender {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(
        &self,
        address: &str,
        payload: &OutboundPayload,
    ) -> Result<DeliveryReceipt, ChannelError> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Mode::Delay(delay) = self.mode {
            tokio::time::sleep(delay).await;
        }
        match self.mode {
            Mode::Deliver | Mode::Delay(_) => {
                self.sent
                    .lock()
                    .unwrap()
                    .push((address.to_string(), payload.text.clone()));
                Ok(DeliveryReceipt::sent(Some(format!("rec-{n}"))))
            }
            Mode::Fail => Err(ChannelError::SendFailed {
                name: "recording".into(),
                reason: "provider rejected the message".into(),
            }),
            Mode::Hang => std::future::pending().await,
        }
    }
}

/// Fixed instant used for inbound test events.
pub(crate) fn received_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

/// Normalize and resolve a flat CHAT payload.
pub(crate) async fn resolve_chat(
    db: &Arc<dyn Database>,
    provider_id: &str,
    from: &str,
    text: &str,
) -> Resolution {
    let payload = json!({ "providerMessageId": provider_id, "from": from, "fromName": "John", "text": text });
    let event = normalize(Channel::Chat, &payload, received_at())
        .unwrap()
        .remove(0);
    Resolver::new(db.clone(), true).resolve(&event).await.unwrap()
}
