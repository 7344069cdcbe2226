//! Inbound normalizer: channel-native webhook payloads to [`InboundEvent`]s.
//!
//! Pure: no I/O, no clock reads. Payloads that carry nothing ingestible
//! (delivery receipts, edits, echoes) normalize to an empty list; payloads
//! that are structurally wrong are reported as `Malformed`.

use chrono::{DateTime, TimeZone, Utc};
use mail_parser::MessageParser;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::IngestError;
use crate::identity::address;
use crate::identity::model::{Channel, MediaDescriptor, MediaKind};
use crate::ingest::types::{InboundEvent, SYNTHETIC_ID_PREFIX};

/// Normalize one webhook delivery.
///
/// `received_at` is used when the payload carries no timestamp of its own.
pub fn normalize(
    channel: Channel,
    raw: &Value,
    received_at: DateTime<Utc>,
) -> Result<Vec<InboundEvent>, IngestError> {
    if !raw.is_object() {
        return Err(malformed(channel, "payload is not a JSON object"));
    }

    // Every channel accepts the flat canonical shape.
    if raw.get("from").is_some_and(Value::is_string) {
        return parse_flat(channel, raw, received_at).map(|e| vec![e]);
    }

    match channel {
        Channel::Chat => parse_chat(raw, received_at),
        Channel::Telegram => parse_telegram(raw, received_at),
        Channel::Social => parse_social(raw, received_at),
        Channel::Email => parse_raw_email(raw, received_at).map(|e| vec![e]),
        Channel::WebChat => parse_web_chat(raw, received_at).map(|e| vec![e]),
    }
}

/// `"syn-" + hex(sha256(address | text | minute))`.
///
/// Redeliveries within the same minute collapse to one id.
pub fn synthetic_id(normalized_address: &str, text: &str, received_at: DateTime<Utc>) -> String {
    let minute = received_at.format("%Y-%m-%dT%H:%M");
    let mut hasher = Sha256::new();
    hasher.update(normalized_address.as_bytes());
    hasher.update(b"|");
    hasher.update(text.as_bytes());
    hasher.update(b"|");
    hasher.update(minute.to_string().as_bytes());
    format!("{SYNTHETIC_ID_PREFIX}{}", hex::encode(hasher.finalize()))
}

// ── Event construction ──────────────────────────────────────────────

struct Draft<'a> {
    provider_id: Option<String>,
    from: &'a str,
    from_name: Option<String>,
    text: String,
    media: Option<MediaDescriptor>,
    received_at: DateTime<Utc>,
    raw: &'a Value,
}

fn build(channel: Channel, draft: Draft<'_>) -> Result<InboundEvent, IngestError> {
    let normalized = address::normalize(channel, draft.from)
        .ok_or_else(|| malformed(channel, "sender address is empty"))?;
    if draft.text.trim().is_empty() && draft.media.is_none() {
        return Err(malformed(channel, "message has neither text nor media"));
    }

    let provider_message_id = match draft.provider_id.filter(|id| !id.trim().is_empty()) {
        Some(id) => id,
        None => synthetic_id(&normalized, &draft.text, draft.received_at),
    };

    Ok(InboundEvent {
        channel,
        provider_message_id,
        from_address: draft.from.trim().to_string(),
        from_name: draft.from_name.filter(|n| !n.trim().is_empty()),
        text: draft.text,
        media: draft.media,
        received_at: draft.received_at,
        raw_payload: draft.raw.clone(),
    })
}

fn malformed(channel: Channel, reason: impl Into<String>) -> IngestError {
    IngestError::Malformed {
        channel: channel.as_str().to_string(),
        reason: reason.into(),
    }
}

/// Events of a multi-message envelope. A bad message is skipped so its
/// siblings still land; the envelope is malformed only if nothing did.
#[derive(Default)]
struct Batch {
    events: Vec<InboundEvent>,
    first_error: Option<IngestError>,
}

impl Batch {
    fn push(&mut self, channel: Channel, result: Result<InboundEvent, IngestError>) {
        match result {
            Ok(event) => self.events.push(event),
            Err(e) => {
                warn!(channel = channel.as_str(), error = %e, "Skipping bad message in envelope");
                self.first_error.get_or_insert(e);
            }
        }
    }

    fn finish(self) -> Result<Vec<InboundEvent>, IngestError> {
        match self.first_error {
            Some(e) if self.events.is_empty() => Err(e),
            _ => Ok(self.events),
        }
    }
}

// ── Value helpers ───────────────────────────────────────────────────

fn text_at<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Ids arrive as numbers from some providers and strings from others.
fn id_at(v: &Value, key: &str) -> Option<String> {
    match v.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Unix seconds, unix milliseconds, numeric strings or RFC 3339.
fn timestamp_at(v: &Value, key: &str) -> Option<DateTime<Utc>> {
    let from_number = |n: i64| {
        if n > 100_000_000_000 {
            Utc.timestamp_millis_opt(n).single()
        } else {
            Utc.timestamp_opt(n, 0).single()
        }
    };
    match v.get(key)? {
        Value::Number(n) => n.as_i64().and_then(from_number),
        Value::String(s) => match s.parse::<i64>() {
            Ok(n) => from_number(n),
            Err(_) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|d| d.with_timezone(&Utc)),
        },
        _ => None,
    }
}

fn media_kind(tag: &str) -> Option<MediaKind> {
    match tag {
        "image" | "photo" | "sticker" => Some(MediaKind::Image),
        "audio" | "voice" => Some(MediaKind::Audio),
        "video" | "video_note" => Some(MediaKind::Video),
        "document" | "file" => Some(MediaKind::Document),
        _ => None,
    }
}

// ── Flat canonical shape ────────────────────────────────────────────

fn parse_flat(
    channel: Channel,
    raw: &Value,
    received_at: DateTime<Utc>,
) -> Result<InboundEvent, IngestError> {
    let from = text_at(raw, "from").ok_or_else(|| malformed(channel, "missing 'from'"))?;
    let mut text = raw
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if text.trim().is_empty()
        && let Some(subject) = text_at(raw, "subject")
    {
        text = subject.to_string();
    }

    build(
        channel,
        Draft {
            provider_id: id_at(raw, "providerMessageId")
                .or_else(|| id_at(raw, "message_id"))
                .or_else(|| id_at(raw, "messageId")),
            from,
            from_name: text_at(raw, "fromName")
                .or_else(|| text_at(raw, "from_name"))
                .map(String::from),
            text,
            media: None,
            received_at: timestamp_at(raw, "timestamp").unwrap_or(received_at),
            raw,
        },
    )
}

// ── CHAT (WhatsApp Cloud envelope) ──────────────────────────────────

fn parse_chat(raw: &Value, received_at: DateTime<Utc>) -> Result<Vec<InboundEvent>, IngestError> {
    let entries = raw
        .get("entry")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed(Channel::Chat, "missing 'entry' array"))?;

    let mut batch = Batch::default();
    for change in entries
        .iter()
        .filter_map(|e| e.get("changes").and_then(Value::as_array))
        .flatten()
    {
        let value = &change["value"];
        let Some(messages) = value.get("messages").and_then(Value::as_array) else {
            debug!("Chat change without messages (status update), skipping");
            continue;
        };
        let contacts = value
            .get("contacts")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for msg in messages {
            if let Some(result) = chat_message(msg, contacts, received_at) {
                batch.push(Channel::Chat, result);
            }
        }
    }
    batch.finish()
}

/// One WhatsApp message; `None` for types that carry nothing ingestible.
fn chat_message(
    msg: &Value,
    contacts: &[Value],
    received_at: DateTime<Utc>,
) -> Option<Result<InboundEvent, IngestError>> {
    let Some(from) = text_at(msg, "from") else {
        return Some(Err(malformed(Channel::Chat, "message without 'from'")));
    };
    let from_name = contacts
        .iter()
        .find(|c| text_at(c, "wa_id") == Some(from))
        .or(contacts.first())
        .and_then(|c| c.pointer("/profile/name"))
        .and_then(Value::as_str)
        .map(String::from);

    let kind = text_at(msg, "type").unwrap_or("text");
    let (text, media) = match kind {
        "text" => (
            msg.pointer("/text/body")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            None,
        ),
        "button" => (
            msg.pointer("/button/text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            None,
        ),
        "interactive" => (
            msg.pointer("/interactive/button_reply/title")
                .or_else(|| msg.pointer("/interactive/list_reply/title"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            None,
        ),
        other => match (media_kind(other), msg.get(other)) {
            (Some(media_kind), Some(body)) => {
                let Some(media_id) = text_at(body, "id") else {
                    return Some(Err(malformed(Channel::Chat, "media without id")));
                };
                let caption = text_at(body, "caption").map(String::from);
                (
                    caption.clone().unwrap_or_default(),
                    Some(MediaDescriptor {
                        media_id: media_id.to_string(),
                        kind: media_kind,
                        mime_type: text_at(body, "mime_type").map(String::from),
                        caption,
                        filename: text_at(body, "filename").map(String::from),
                    }),
                )
            }
            _ => {
                debug!(kind = other, "Unsupported chat message type, skipping");
                return None;
            }
        },
    };

    Some(build(
        Channel::Chat,
        Draft {
            provider_id: id_at(msg, "id"),
            from,
            from_name,
            text,
            media,
            received_at: timestamp_at(msg, "timestamp").unwrap_or(received_at),
            raw: msg,
        },
    ))
}

// ── TELEGRAM (Bot API update) ───────────────────────────────────────

fn parse_telegram(
    raw: &Value,
    received_at: DateTime<Utc>,
) -> Result<Vec<InboundEvent>, IngestError> {
    let Some(msg) = raw.get("message") else {
        debug!("Telegram update without 'message' (edit or callback), skipping");
        return Ok(Vec::new());
    };

    let from = msg
        .get("from")
        .ok_or_else(|| malformed(Channel::Telegram, "message without 'from'"))?;
    let from_id = id_at(from, "id").ok_or_else(|| malformed(Channel::Telegram, "sender without id"))?;
    let from_name = match (text_at(from, "first_name"), text_at(from, "last_name")) {
        (Some(first), Some(last)) => Some(format!("{first} {last}")),
        (Some(first), None) => Some(first.to_string()),
        (None, _) => text_at(from, "username").map(String::from),
    };

    // message_id is only unique within a chat.
    let chat_id = msg
        .get("chat")
        .and_then(|c| id_at(c, "id"))
        .unwrap_or_else(|| from_id.clone());
    let provider_id = id_at(msg, "message_id").map(|mid| format!("{chat_id}:{mid}"));

    let caption = text_at(msg, "caption").map(String::from);
    let media = telegram_media(msg, caption.clone());
    let text = text_at(msg, "text")
        .map(String::from)
        .or(caption)
        .unwrap_or_default();

    build(
        Channel::Telegram,
        Draft {
            provider_id,
            from: &from_id,
            from_name,
            text,
            media,
            received_at: timestamp_at(msg, "date").unwrap_or(received_at),
            raw: msg,
        },
    )
    .map(|e| vec![e])
}

fn telegram_media(msg: &Value, caption: Option<String>) -> Option<MediaDescriptor> {
    // Photos come as a size ladder; the last entry is the largest.
    if let Some(largest) = msg
        .get("photo")
        .and_then(Value::as_array)
        .and_then(|sizes| sizes.last())
    {
        return text_at(largest, "file_id").map(|id| MediaDescriptor {
            media_id: id.to_string(),
            kind: MediaKind::Image,
            mime_type: Some("image/jpeg".into()),
            caption,
            filename: None,
        });
    }

    ["voice", "audio", "video", "video_note", "document", "sticker"]
        .iter()
        .find_map(|key| {
            let body = msg.get(*key)?;
            Some(MediaDescriptor {
                media_id: text_at(body, "file_id")?.to_string(),
                kind: media_kind(key)?,
                mime_type: text_at(body, "mime_type").map(String::from),
                caption: caption.clone(),
                filename: text_at(body, "file_name").map(String::from),
            })
        })
}

// ── SOCIAL (Messenger / Instagram) ──────────────────────────────────

fn parse_social(raw: &Value, received_at: DateTime<Utc>) -> Result<Vec<InboundEvent>, IngestError> {
    let entries = raw
        .get("entry")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed(Channel::Social, "missing 'entry' array"))?;

    let mut batch = Batch::default();
    for item in entries
        .iter()
        .filter_map(|e| e.get("messaging").and_then(Value::as_array))
        .flatten()
    {
        let Some(message) = item.get("message") else {
            continue;
        };
        if message
            .get("is_echo")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            continue;
        }
        let Some(from) = item.get("sender").and_then(|s| id_at(s, "id")) else {
            batch.push(
                Channel::Social,
                Err(malformed(Channel::Social, "messaging item without sender id")),
            );
            continue;
        };

        let media = message
            .get("attachments")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(|attachment| {
                let kind = media_kind(text_at(attachment, "type")?)?;
                let payload = attachment.get("payload")?;
                let media_id =
                    id_at(payload, "attachment_id").or_else(|| id_at(payload, "url"))?;
                Some(MediaDescriptor {
                    media_id,
                    kind,
                    mime_type: None,
                    caption: None,
                    filename: None,
                })
            });

        batch.push(
            Channel::Social,
            build(
                Channel::Social,
                Draft {
                    provider_id: id_at(message, "mid"),
                    from: &from,
                    from_name: None,
                    text: text_at(message, "text").unwrap_or_default().to_string(),
                    media,
                    received_at: timestamp_at(item, "timestamp").unwrap_or(received_at),
                    raw: item,
                },
            ),
        );
    }
    batch.finish()
}

// ── EMAIL (raw RFC 822) ─────────────────────────────────────────────

fn parse_raw_email(raw: &Value, received_at: DateTime<Utc>) -> Result<InboundEvent, IngestError> {
    let source = text_at(raw, "raw")
        .ok_or_else(|| malformed(Channel::Email, "expected 'from' or 'raw'"))?;
    let parsed = MessageParser::default()
        .parse(source.as_bytes())
        .ok_or_else(|| malformed(Channel::Email, "unparseable RFC 822 message"))?;

    let sender = parsed.from().and_then(|addr| addr.first());
    let from = sender
        .and_then(|a| a.address())
        .ok_or_else(|| malformed(Channel::Email, "message without From address"))?;
    let from_name = sender.and_then(|a| a.name()).map(String::from);

    let body = parsed
        .body_text(0)
        .map(|t| t.trim().to_string())
        .unwrap_or_default();
    let text = if body.is_empty() {
        parsed.subject().unwrap_or_default().to_string()
    } else {
        body
    };

    build(
        Channel::Email,
        Draft {
            provider_id: parsed.message_id().map(String::from),
            from,
            from_name,
            text,
            media: None,
            received_at,
            raw,
        },
    )
}

// ── WEB_CHAT widget ─────────────────────────────────────────────────

fn parse_web_chat(raw: &Value, received_at: DateTime<Utc>) -> Result<InboundEvent, IngestError> {
    let visitor = id_at(raw, "visitor_id")
        .ok_or_else(|| malformed(Channel::WebChat, "missing 'visitor_id'"))?;
    build(
        Channel::WebChat,
        Draft {
            provider_id: id_at(raw, "message_id"),
            from: &visitor,
            from_name: text_at(raw, "name").map(String::from),
            text: text_at(raw, "text").unwrap_or_default().to_string(),
            media: None,
            received_at: timestamp_at(raw, "timestamp").unwrap_or(received_at),
            raw,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 15, 42).unwrap()
    }

    #[test]
    fn chat_envelope_with_two_messages() {
        let payload = json!({
            "object": "whatsapp_business_account",
            "entry": [{ "changes": [{ "value": {
                "contacts": [{ "wa_id": "15550001111", "profile": { "name": "John" } }],
                "messages": [
                    { "from": "15550001111", "id": "wamid.1", "timestamp": "1772446500",
                      "type": "text", "text": { "body": "Hi, I need a quote" } },
                    { "from": "15550001111", "id": "wamid.2", "type": "image",
                      "image": { "id": "media-9", "mime_type": "image/jpeg", "caption": "my roof" } }
                ]
            }}]}]
        });

        let events = normalize(Channel::Chat, &payload, now()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].provider_message_id, "wamid.1");
        assert_eq!(events[0].from_name.as_deref(), Some("John"));
        assert_eq!(events[0].received_at.timestamp(), 1_772_446_500);
        assert_eq!(events[1].text, "my roof");
        let media = events[1].media.as_ref().unwrap();
        assert_eq!(media.media_id, "media-9");
        assert_eq!(media.kind, MediaKind::Image);
        assert_eq!(events[1].received_at, now());
    }

    #[test]
    fn bad_message_in_envelope_does_not_drop_siblings() {
        let payload = json!({
            "entry": [{ "changes": [{ "value": {
                "messages": [
                    { "id": "wamid.1", "type": "text", "text": { "body": "no sender" } },
                    { "from": "15550001111", "id": "wamid.2", "type": "image", "image": {} },
                    { "from": "15550001111", "id": "wamid.3", "type": "text", "text": { "body": "hello" } }
                ]
            }}]}]
        });
        let events = normalize(Channel::Chat, &payload, now()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].provider_message_id, "wamid.3");

        let social = json!({
            "entry": [{ "messaging": [
                { "message": { "mid": "m.1", "text": "anonymous" } },
                { "sender": { "id": "42" }, "message": { "mid": "m.2", "text": "hi" } }
            ]}]
        });
        let events = normalize(Channel::Social, &social, now()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].provider_message_id, "m.2");

        // Nothing usable at all is still malformed.
        let all_bad = json!({
            "entry": [{ "changes": [{ "value": {
                "messages": [{ "id": "wamid.9", "type": "text", "text": { "body": "x" } }]
            }}]}]
        });
        assert!(matches!(
            normalize(Channel::Chat, &all_bad, now()),
            Err(IngestError::Malformed { .. })
        ));
    }

    #[test]
    fn chat_status_update_yields_nothing() {
        let payload = json!({
            "entry": [{ "changes": [{ "value": { "statuses": [{ "id": "wamid.1", "status": "read" }] } }] }]
        });
        assert!(normalize(Channel::Chat, &payload, now()).unwrap().is_empty());
    }

    #[test]
    fn telegram_message_and_photo() {
        let payload = json!({
            "update_id": 10,
            "message": {
                "message_id": 7,
                "from": { "id": 4242, "first_name": "Ana", "last_name": "Lopez" },
                "chat": { "id": 4242 },
                "date": 1772446500,
                "caption": "see attached",
                "photo": [{ "file_id": "small" }, { "file_id": "large" }]
            }
        });
        let events = normalize(Channel::Telegram, &payload, now()).unwrap();
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e.provider_message_id, "4242:7");
        assert_eq!(e.from_address, "4242");
        assert_eq!(e.from_name.as_deref(), Some("Ana Lopez"));
        assert_eq!(e.text, "see attached");
        assert_eq!(e.media.as_ref().unwrap().media_id, "large");
    }

    #[test]
    fn telegram_edit_is_ignored() {
        let payload = json!({ "update_id": 11, "edited_message": { "message_id": 7 } });
        assert!(normalize(Channel::Telegram, &payload, now()).unwrap().is_empty());
    }

    #[test]
    fn social_skips_echoes() {
        let payload = json!({
            "object": "page",
            "entry": [{ "messaging": [
                { "sender": { "id": "PSID1" }, "timestamp": 1772446500000_i64,
                  "message": { "mid": "m_1", "text": "hello" } },
                { "sender": { "id": "PAGE" }, "message": { "mid": "m_2", "text": "echo", "is_echo": true } },
                { "sender": { "id": "PSID1" }, "delivery": { "mids": ["m_0"] } }
            ]}]
        });
        let events = normalize(Channel::Social, &payload, now()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].provider_message_id, "m_1");
        assert_eq!(events[0].received_at.timestamp(), 1_772_446_500);
    }

    #[test]
    fn raw_email_is_parsed() {
        let raw = "From: Jane Doe <jane@example.com>\r\n\
                   To: sales@shop.test\r\n\
                   Subject: Quote\r\n\
                   Message-ID: <abc@example.com>\r\n\
                   \r\n\
                   Could you send pricing?\r\n";
        let events = normalize(Channel::Email, &json!({ "raw": raw }), now()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].from_address, "jane@example.com");
        assert_eq!(events[0].from_name.as_deref(), Some("Jane Doe"));
        assert_eq!(events[0].provider_message_id, "abc@example.com");
        assert_eq!(events[0].text, "Could you send pricing?");
    }

    #[test]
    fn flat_shape_without_id_gets_stable_synthetic_id() {
        let payload = json!({ "from": "visitor-1", "text": "hello" });
        let first = normalize(Channel::WebChat, &payload, now()).unwrap();
        let later_same_minute = normalize(
            Channel::WebChat,
            &payload,
            Utc.with_ymd_and_hms(2026, 3, 2, 10, 15, 59).unwrap(),
        )
        .unwrap();
        let next_minute = normalize(
            Channel::WebChat,
            &payload,
            Utc.with_ymd_and_hms(2026, 3, 2, 10, 16, 0).unwrap(),
        )
        .unwrap();

        assert!(first[0].has_synthetic_id());
        assert_eq!(first[0].provider_message_id, later_same_minute[0].provider_message_id);
        assert_ne!(first[0].provider_message_id, next_minute[0].provider_message_id);
    }

    #[test]
    fn flat_email_uses_subject_when_body_empty() {
        let payload = json!({
            "from": "Bob <bob@example.com>", "from_name": "Bob",
            "subject": "Callback please", "text": "", "message_id": "m-77"
        });
        let events = normalize(Channel::Email, &payload, now()).unwrap();
        assert_eq!(events[0].text, "Callback please");
        assert_eq!(events[0].provider_message_id, "m-77");
    }

    #[test]
    fn malformed_payloads_are_reported() {
        assert!(matches!(
            normalize(Channel::Chat, &json!([1, 2]), now()),
            Err(IngestError::Malformed { .. })
        ));
        assert!(matches!(
            normalize(Channel::WebChat, &json!({ "text": "hi" }), now()),
            Err(IngestError::Malformed { .. })
        ));
        assert!(matches!(
            normalize(Channel::Chat, &json!({ "from": "+1", "text": "  " }), now()),
            Err(IngestError::Malformed { .. })
        ));
    }
}
