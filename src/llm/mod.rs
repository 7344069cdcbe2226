//! LLM integration for reply drafting.
//!
//! Supports:
//! - **Anthropic**: Direct API access via rig-core
//! - **OpenAI**: Direct API access via rig-core
//!
//! Without an API key the pipeline uses [`TemplateDraftGenerator`].

pub mod draft;

pub use draft::{
    DraftContext, DraftGenerator, RigDraftGenerator, TemplateDraftGenerator, draft_or_fallback,
};

use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::{ExposeSecret, SecretString};

use crate::error::LlmError;

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

/// Configuration for creating a draft generator.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: SecretString,
    pub model: String,
}

impl LlmConfig {
    /// `ANTHROPIC_API_KEY` wins over `OPENAI_API_KEY`; `None` when neither is set.
    pub fn from_env() -> Option<Self> {
        let key = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        let (backend, api_key, default_model) = if let Some(k) = key("ANTHROPIC_API_KEY") {
            (LlmBackend::Anthropic, k, "claude-3-5-haiku-latest")
        } else if let Some(k) = key("OPENAI_API_KEY") {
            (LlmBackend::OpenAi, k, "gpt-4o-mini")
        } else {
            return None;
        };

        Some(Self {
            backend,
            api_key: SecretString::from(api_key),
            model: key("LEADLINE_MODEL").unwrap_or_else(|| default_model.to_string()),
        })
    }
}

/// Create a draft generator from configuration.
pub fn create_drafter(config: &LlmConfig) -> Result<Arc<dyn DraftGenerator>, LlmError> {
    match config.backend {
        LlmBackend::Anthropic => create_anthropic_drafter(config),
        LlmBackend::OpenAi => create_openai_drafter(config),
    }
}

fn create_anthropic_drafter(config: &LlmConfig) -> Result<Arc<dyn DraftGenerator>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Drafting with Anthropic (model: {})", config.model);
    Ok(Arc::new(RigDraftGenerator::new(
        model,
        "anthropic",
        &config.model,
    )))
}

fn create_openai_drafter(config: &LlmConfig) -> Result<Arc<dyn DraftGenerator>, LlmError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("Failed to create OpenAI client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Drafting with OpenAI (model: {})", config.model);
    Ok(Arc::new(RigDraftGenerator::new(model, "openai", &config.model)))
}
