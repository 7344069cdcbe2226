//! Reply drafting.
//!
//! The draft generator is best-effort: any error or timeout falls back to the
//! deterministic template carried in the [`DraftContext`].

use std::time::Duration;

use async_trait::async_trait;
use rig::agent::{Agent, AgentBuilder};
use rig::completion::{CompletionModel, Prompt};
use serde::Serialize;

use crate::error::LlmError;
use crate::identity::model::Channel;

const DRAFT_PREAMBLE: &str = "You write short, friendly customer-service messages for a \
sales team. Rephrase the given message naturally for the channel. Keep the meaning \
and any question intact. Never invent prices, dates, or commitments. Reply with the \
message text only.";

/// What the generator knows when drafting one reply.
#[derive(Debug, Clone, Serialize)]
pub struct DraftContext {
    pub channel: Channel,
    pub contact_name: Option<String>,
    /// Question key being asked (`__confirm__` / `__done__` for the fixed steps).
    pub question_key: String,
    /// Latest customer text, if the reply answers one.
    pub last_inbound: Option<String>,
    /// Field values collected so far, as `(field, value)` pairs.
    pub collected: Vec<(String, String)>,
    /// Deterministic text used when generation fails.
    pub fallback: String,
}

impl DraftContext {
    fn prompt(&self) -> String {
        let mut prompt = format!(
            "Channel: {}\nCustomer name: {}\n",
            self.channel.as_str().to_lowercase(),
            self.contact_name.as_deref().unwrap_or("unknown"),
        );
        if let Some(inbound) = &self.last_inbound {
            prompt.push_str(&format!("Customer's last message: {inbound}\n"));
        }
        if !self.collected.is_empty() {
            prompt.push_str("Known details:\n");
            for (field, value) in &self.collected {
                prompt.push_str(&format!("- {field}: {value}\n"));
            }
        }
        prompt.push_str(&format!("Message to send: {}", self.fallback));
        prompt
    }
}

/// Produces reply text.
#[async_trait]
pub trait DraftGenerator: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, ctx: &DraftContext) -> Result<String, LlmError>;
}

/// Returns the template unchanged.
#[derive(Debug, Default)]
pub struct TemplateDraftGenerator;

#[async_trait]
impl DraftGenerator for TemplateDraftGenerator {
    fn model_name(&self) -> &str {
        "template"
    }

    async fn generate(&self, ctx: &DraftContext) -> Result<String, LlmError> {
        Ok(ctx.fallback.clone())
    }
}

/// Draft generator backed by a rig completion model.
pub struct RigDraftGenerator<M: CompletionModel> {
    agent: Agent<M>,
    provider: String,
    model_name: String,
}

impl<M: CompletionModel> RigDraftGenerator<M> {
    pub fn new(model: M, provider: &str, model_name: &str) -> Self {
        Self {
            agent: AgentBuilder::new(model).preamble(DRAFT_PREAMBLE).build(),
            provider: provider.to_string(),
            model_name: model_name.to_string(),
        }
    }
}

#[async_trait]
impl<M> DraftGenerator for RigDraftGenerator<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn generate(&self, ctx: &DraftContext) -> Result<String, LlmError> {
        let text = self
            .agent
            .prompt(ctx.prompt())
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: self.provider.clone(),
                reason: e.to_string(),
            })?;

        let text = text.trim();
        if text.is_empty() {
            return Err(LlmError::EmptyResponse {
                provider: self.provider.clone(),
            });
        }
        Ok(text.to_string())
    }
}

/// Generate a draft within `timeout`, falling back to the template.
pub async fn draft_or_fallback(
    generator: &dyn DraftGenerator,
    ctx: &DraftContext,
    timeout: Duration,
) -> String {
    let result = match tokio::time::timeout(timeout, generator.generate(ctx)).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout(timeout)),
    };

    match result {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(
                model = generator.model_name(),
                question_key = %ctx.question_key,
                error = %e,
                "Draft generation failed; using template"
            );
            ctx.fallback.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingGenerator;

    #[async_trait]
    impl DraftGenerator for FailingGenerator {
        fn model_name(&self) -> &str {
            "failing"
        }

        async fn generate(&self, _ctx: &DraftContext) -> Result<String, LlmError> {
            Err(LlmError::EmptyResponse {
                provider: "test".into(),
            })
        }
    }

    struct SlowGenerator;

    #[async_trait]
    impl DraftGenerator for SlowGenerator {
        fn model_name(&self) -> &str {
            "slow"
        }

        async fn generate(&self, _ctx: &DraftContext) -> Result<String, LlmError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("too late".into())
        }
    }

    fn ctx() -> DraftContext {
        DraftContext {
            channel: Channel::Chat,
            contact_name: Some("Ana".into()),
            question_key: "service".into(),
            last_inbound: Some("Hi, I'm Ana".into()),
            collected: vec![("name".into(), "Ana".into())],
            fallback: "Which service are you interested in?".into(),
        }
    }

    #[tokio::test]
    async fn template_generator_returns_fallback() {
        let text = draft_or_fallback(&TemplateDraftGenerator, &ctx(), Duration::from_secs(1)).await;
        assert_eq!(text, "Which service are you interested in?");
    }

    #[tokio::test]
    async fn failure_falls_back_to_template() {
        let text = draft_or_fallback(&FailingGenerator, &ctx(), Duration::from_secs(1)).await;
        assert_eq!(text, ctx().fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_falls_back_to_template() {
        let text = draft_or_fallback(&SlowGenerator, &ctx(), Duration::from_secs(2)).await;
        assert_eq!(text, ctx().fallback);
    }

    #[test]
    fn prompt_includes_known_details() {
        let prompt = ctx().prompt();
        assert!(prompt.contains("Channel: chat"));
        assert!(prompt.contains("- name: Ana"));
        assert!(prompt.ends_with("Message to send: Which service are you interested in?"));
    }
}
