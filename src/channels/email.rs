//! SMTP email sender.
//!
//! Inbound email arrives through the webhook surface; this adapter only sends.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::channels::{ChannelSender, DeliveryReceipt, OutboundPayload};
use crate::error::ChannelError;

const NAME: &str = "email";

/// SMTP configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    /// Subject line used for automated and operator replies.
    pub subject: String,
}

impl EmailConfig {
    /// Returns `None` when `SMTP_HOST` is unset.
    pub fn from_env() -> Option<Self> {
        let smtp_host = std::env::var("SMTP_HOST").ok()?;

        let smtp_port: u16 = std::env::var("SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("SMTP_USERNAME").unwrap_or_default();
        let password = std::env::var("SMTP_PASSWORD").unwrap_or_default();
        let from_address = std::env::var("SMTP_FROM_ADDRESS").unwrap_or_else(|_| username.clone());
        let subject =
            std::env::var("SMTP_SUBJECT").unwrap_or_else(|_| "Re: your enquiry".to_string());

        Some(Self {
            smtp_host,
            smtp_port,
            username,
            password: SecretString::from(password),
            from_address,
            subject,
        })
    }

    /// Domain part of the from address, used for generated Message-IDs.
    fn domain(&self) -> &str {
        self.from_address
            .rsplit_once('@')
            .map(|(_, d)| d.trim_end_matches('>'))
            .unwrap_or("localhost")
    }
}

/// Email sender over SMTP.
pub struct EmailSender {
    config: EmailConfig,
}

impl EmailSender {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    fn build_message(&self, to: &str, body: &str, message_id: &str) -> Result<Message, ChannelError> {
        let from: Mailbox = self.config.from_address.parse().map_err(|e| {
            ChannelError::SendFailed {
                name: NAME.into(),
                reason: format!("Invalid from address: {e}"),
            }
        })?;
        let to: Mailbox = to.parse().map_err(|_| ChannelError::InvalidAddress {
            name: NAME.into(),
            address: to.into(),
        })?;

        Message::builder()
            .from(from)
            .to(to)
            .subject(self.config.subject.clone())
            .message_id(Some(message_id.to_string()))
            .body(body.to_string())
            .map_err(|e| ChannelError::SendFailed {
                name: NAME.into(),
                reason: format!("Failed to build email: {e}"),
            })
    }

    fn transport(&self) -> Result<SmtpTransport, ChannelError> {
        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );

        Ok(SmtpTransport::relay(&self.config.smtp_host)
            .map_err(|e| ChannelError::SendFailed {
                name: NAME.into(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(self.config.smtp_port)
            .credentials(creds)
            .build())
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    fn name(&self) -> &str {
        NAME
    }

    async fn send(
        &self,
        address: &str,
        payload: &OutboundPayload,
    ) -> Result<DeliveryReceipt, ChannelError> {
        let message_id = format!("<{}@{}>", Uuid::new_v4(), self.config.domain());
        let email = self.build_message(address, &payload.text, &message_id)?;
        let transport = self.transport()?;

        // lettre's SmtpTransport is blocking.
        tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: NAME.into(),
                reason: format!("SMTP task failed: {e}"),
            })?
            .map_err(|e| ChannelError::SendFailed {
                name: NAME.into(),
                reason: format!("SMTP send error: {e}"),
            })?;

        tracing::info!(to = address, message_id = %message_id, "Email sent");
        Ok(DeliveryReceipt::sent(message_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EmailConfig {
        EmailConfig {
            smtp_host: "smtp.test.com".into(),
            smtp_port: 587,
            username: "user".into(),
            password: SecretString::from("pass".to_string()),
            from_address: "Sales <sales@test.com>".into(),
            subject: "Re: your enquiry".into(),
        }
    }

    #[test]
    fn email_sender_name() {
        assert_eq!(EmailSender::new(config()).name(), "email");
    }

    #[test]
    fn domain_from_display_address() {
        assert_eq!(config().domain(), "test.com");
    }

    #[test]
    fn builds_message_with_message_id() {
        let sender = EmailSender::new(config());
        let message = sender
            .build_message("jane@example.com", "Hello Jane", "<abc@test.com>")
            .unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Message-ID: <abc@test.com>"));
        assert!(raw.contains("To: jane@example.com"));
        assert!(raw.contains("Hello Jane"));
    }

    #[test]
    fn rejects_invalid_recipient() {
        let sender = EmailSender::new(config());
        let err = sender
            .build_message("not an address", "Hello", "<abc@test.com>")
            .unwrap_err();
        assert!(matches!(err, ChannelError::InvalidAddress { .. }));
    }
}
