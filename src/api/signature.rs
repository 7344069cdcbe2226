//! Webhook signature checks.
//!
//! Meta-style providers sign the raw body with HMAC-SHA256 and send
//! `sha256=<hex>`; Telegram echoes a shared secret token instead.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use crate::config::WebhookSecrets;
use crate::error::IngestError;
use crate::identity::model::Channel;

type HmacSha256 = Hmac<Sha256>;

pub const HUB_SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const ALT_SIGNATURE_HEADER: &str = "x-signature-256";
pub const TELEGRAM_TOKEN_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Check `sha256=<hex>` against the HMAC of `body`. Comparison is constant time.
pub fn verify_hmac(secret: &SecretString, body: &[u8], header_value: &str) -> bool {
    let Some(hex_sig) = header_value.trim().strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.expose_secret().as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// `sha256=<hex>` signature for `body`, as a provider would send it.
pub fn sign(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Verify a delivery for `channel`. Channels without a secret pass.
pub fn verify_delivery(
    channel: Channel,
    secrets: &WebhookSecrets,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), IngestError> {
    let Some(secret) = secrets.get(channel) else {
        return Ok(());
    };
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let valid = if channel == Channel::Telegram {
        header(TELEGRAM_TOKEN_HEADER).is_some_and(|token| {
            constant_time_eq(token.as_bytes(), secret.expose_secret().as_bytes())
        })
    } else {
        header(HUB_SIGNATURE_HEADER)
            .or_else(|| header(ALT_SIGNATURE_HEADER))
            .is_some_and(|sig| verify_hmac(secret, body, sig))
    };

    if valid {
        Ok(())
    } else {
        Err(IngestError::SignatureRejected(channel.as_str().to_string()))
    }
}
