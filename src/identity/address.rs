//! Channel-scoped address normalization.
//!
//! Phone channels are canonical `+digits`, whether or not the provider sent
//! the `+`. Every other channel gets a
//! short prefix so identical handles on different networks never collide.

use super::model::Channel;

/// Prefix applied to non-phone addresses.
pub fn prefix(channel: Channel) -> Option<&'static str> {
    match channel {
        Channel::Chat => None,
        Channel::Telegram => Some("tg:"),
        Channel::Social => Some("social:"),
        Channel::Email => Some("email:"),
        Channel::WebChat => Some("web:"),
    }
}

/// Normalize a raw sender address for `channel`.
///
/// Returns `None` when nothing usable remains after normalization.
pub fn normalize(channel: Channel, raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let bare = match prefix(channel) {
        Some(p) => trimmed.strip_prefix(p).unwrap_or(trimmed),
        None => trimmed,
    };

    let normalized = match channel {
        Channel::Chat => normalize_phone(bare),
        Channel::Email => extract_email(bare).to_lowercase(),
        Channel::Telegram | Channel::Social | Channel::WebChat => bare.trim().to_lowercase(),
    };
    if normalized.is_empty() || normalized == "+" {
        return None;
    }

    Some(match prefix(channel) {
        Some(p) => format!("{p}{normalized}"),
        None => normalized,
    })
}

/// Strip the channel prefix, giving the address the provider API expects.
pub fn provider_address(channel: Channel, normalized: &str) -> String {
    match prefix(channel) {
        Some(p) => normalized.strip_prefix(p).unwrap_or(normalized).to_string(),
        None => normalized.to_string(),
    }
}

fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    format!("+{digits}")
}

/// Pull `a@b` out of `Name <a@b>`.
fn extract_email(raw: &str) -> &str {
    match (raw.rfind('<'), raw.rfind('>')) {
        (Some(start), Some(end)) if start < end => raw[start + 1..end].trim(),
        _ => raw.trim(),
    }
}
