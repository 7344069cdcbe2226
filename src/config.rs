//! Configuration types.
//!
//! Every policy constant of the pipeline lives here so operators can tune
//! windows and thresholds without a rebuild.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::identity::model::Channel;

/// Tunables for ingestion, dispatch, the reply machine and the scheduler.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Trailing window in which identical outbound text is suppressed.
    pub outbound_window: Duration,
    /// Edit-distance ratio at or above which outbound text counts as a near-duplicate.
    pub similarity_threshold: f64,
    /// Upper bound on a single channel send.
    pub send_timeout: Duration,
    /// Upper bound on a single draft generation before the template is used.
    pub draft_timeout: Duration,
    /// Maximum automated follow-up steps per conversation.
    pub max_follow_ups: u32,
    /// Create a fresh lead when the contact's latest lead is terminal.
    pub reopen_on_terminal: bool,
    /// Version-checked memory write attempts before giving up.
    pub memory_write_attempts: u32,
    /// How often the scheduler looks for due scheduled rules.
    pub scheduler_interval: Duration,
    /// Optional JSON file with question flows.
    pub flows_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            outbound_window: Duration::from_secs(300), // 5 minutes
            similarity_threshold: 0.9,
            send_timeout: Duration::from_secs(15),
            draft_timeout: Duration::from_secs(10),
            max_follow_ups: 3,
            reopen_on_terminal: true,
            memory_write_attempts: 3,
            scheduler_interval: Duration::from_secs(60),
            flows_path: None,
        }
    }
}

impl PipelineConfig {
    /// Build from `LEADLINE_*` environment variables, defaulting anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let similarity_threshold =
            env_parse("LEADLINE_SIMILARITY_THRESHOLD", defaults.similarity_threshold)?;
        if !(0.0..=1.0).contains(&similarity_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "LEADLINE_SIMILARITY_THRESHOLD".into(),
                message: format!("{similarity_threshold} is outside 0.0..=1.0"),
            });
        }

        Ok(Self {
            outbound_window: Duration::from_secs(env_parse(
                "LEADLINE_OUTBOUND_WINDOW_SECS",
                defaults.outbound_window.as_secs(),
            )?),
            similarity_threshold,
            send_timeout: Duration::from_secs(env_parse(
                "LEADLINE_SEND_TIMEOUT_SECS",
                defaults.send_timeout.as_secs(),
            )?),
            draft_timeout: Duration::from_secs(env_parse(
                "LEADLINE_DRAFT_TIMEOUT_SECS",
                defaults.draft_timeout.as_secs(),
            )?),
            max_follow_ups: env_parse("LEADLINE_MAX_FOLLOW_UPS", defaults.max_follow_ups)?,
            reopen_on_terminal: env_parse(
                "LEADLINE_REOPEN_ON_TERMINAL",
                defaults.reopen_on_terminal,
            )?,
            memory_write_attempts: env_parse(
                "LEADLINE_MEMORY_WRITE_ATTEMPTS",
                defaults.memory_write_attempts,
            )?
            .max(1),
            scheduler_interval: Duration::from_secs(env_parse(
                "LEADLINE_SCHEDULER_INTERVAL_SECS",
                defaults.scheduler_interval.as_secs(),
            )?),
            flows_path: std::env::var("LEADLINE_FLOWS_PATH").ok().map(PathBuf::from),
        })
    }
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub log_dir: Option<PathBuf>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            port: env_parse("LEADLINE_PORT", 8080)?,
            db_path: std::env::var("LEADLINE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/leadline.db")),
            log_dir: std::env::var("LEADLINE_LOG_DIR").ok().map(PathBuf::from),
        })
    }
}

/// Per-channel webhook secrets.
///
/// A channel without a secret accepts unsigned deliveries.
#[derive(Debug, Clone, Default)]
pub struct WebhookSecrets {
    secrets: HashMap<Channel, SecretString>,
    /// Token echoed back during `hub.mode=subscribe` verification.
    pub verify_token: Option<SecretString>,
}

impl WebhookSecrets {
    /// Read `LEADLINE_<CHANNEL>_WEBHOOK_SECRET` for every channel.
    pub fn from_env() -> Self {
        let mut secrets = HashMap::new();
        for channel in Channel::ALL {
            let key = format!("LEADLINE_{}_WEBHOOK_SECRET", channel.as_str());
            if let Ok(value) = std::env::var(&key)
                && !value.is_empty()
            {
                secrets.insert(channel, SecretString::from(value));
            }
        }
        Self {
            secrets,
            verify_token: std::env::var("LEADLINE_WEBHOOK_VERIFY_TOKEN")
                .ok()
                .map(SecretString::from),
        }
    }

    pub fn with_secret(mut self, channel: Channel, secret: &str) -> Self {
        self.secrets
            .insert(channel, SecretString::from(secret.to_string()));
        self
    }

    pub fn get(&self, channel: Channel) -> Option<&SecretString> {
        self.secrets.get(&channel)
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_policy() {
        let config = PipelineConfig::default();
        assert_eq!(config.outbound_window, Duration::from_secs(300));
        assert!((config.similarity_threshold - 0.9).abs() < f64::EPSILON);
        assert!(config.reopen_on_terminal);
        assert_eq!(config.memory_write_attempts, 3);
    }

    #[test]
    fn env_parse_falls_back_when_unset() {
        let value: u64 = env_parse("LEADLINE_TEST_SURELY_UNSET_KEY", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn webhook_secrets_builder() {
        let secrets = WebhookSecrets::default().with_secret(Channel::Chat, "s3cret");
        assert!(secrets.get(Channel::Chat).is_some());
        assert!(secrets.get(Channel::Email).is_none());
    }
}
