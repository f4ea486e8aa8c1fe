//! Provider adapters.
//!
//! Each adapter translates canonical [`Message`]s and [`ToolDef`]s into one
//! provider's wire format, sends the request over the shared transport, and
//! parses the response back into canonical types. The rest of the runtime
//! only ever talks to the [`ChatModel`] trait, which also gives tests a
//! seam for scripted models.
//!
//! The OpenAI-compatible adapter serves every provider speaking that
//! dialect (openai, groq, ollama, lmstudio, vllm, sglang, openrouter,
//! together, custom); Anthropic, Gemini, and Mistral have their own.

pub mod anthropic;
pub mod gemini;
pub mod mistral;
pub mod openai;

use crate::error::{Error, ProviderErrorKind, Result};
use crate::model::{Model, ModelSettings, Provider};
use crate::stream::EventStream;
use crate::tools::ToolDef;
use crate::types::{FinishReason, Message, Usage};
use async_trait::async_trait;
use std::sync::Arc;

/// A parsed, canonical chat response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Assistant message with text / thinking / tool-call parts.
    pub message: Message,
    /// Usage for this single request (`requests` already set to 1).
    pub usage: Usage,
    pub finish: FinishReason,
}

/// The interface every provider adapter (and test double) implements.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Issues a non-streaming chat request.
    async fn request(
        &self,
        model: &Model,
        messages: &[Message],
        tools: &[ToolDef],
        settings: &ModelSettings,
    ) -> Result<ChatResponse>;

    /// Issues a streaming chat request, returning canonical events.
    async fn request_stream(
        &self,
        model: &Model,
        messages: &[Message],
        tools: &[ToolDef],
        settings: &ModelSettings,
    ) -> Result<EventStream>;
}

/// Returns the adapter for a provider tag.
pub fn dispatch(provider: Provider) -> Arc<dyn ChatModel> {
    match provider {
        Provider::Anthropic => Arc::new(anthropic::AnthropicAdapter),
        Provider::Gemini => Arc::new(gemini::GeminiAdapter),
        Provider::Mistral => Arc::new(mistral::MistralAdapter),
        _ => Arc::new(openai::OpenAiAdapter),
    }
}

/// Resolves the model's API key, failing with an authentication error for
/// cloud providers configured without one. Parse time never fails on a
/// missing key; this is the request-time check.
pub(crate) fn require_api_key(model: &Model) -> Result<Option<&str>> {
    match (&model.api_key, model.provider.requires_api_key()) {
        (Some(key), _) => Ok(Some(key.as_str())),
        (None, false) => Ok(None),
        (None, true) => Err(Error::provider(
            model.provider.as_str(),
            ProviderErrorKind::Authentication,
            None,
            format!(
                "no API key configured for {} (set {})",
                model.provider,
                model.provider.api_key_env().unwrap_or("the api_key option"),
            ),
        )),
    }
}

/// Renders a tool-result value for providers that expect string content.
pub(crate) fn value_to_content(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_fails_at_request_time() {
        std::env::remove_var("GROQ_API_KEY");
        let model = Model::parse("groq:llama-3.3-70b-versatile").unwrap();
        let err = require_api_key(&model).unwrap_err();
        assert_eq!(err.code(), "provider_error/authentication");
    }

    #[test]
    fn test_local_provider_needs_no_key() {
        let model = Model::parse("lmstudio:qwen2.5-32b-instruct").unwrap();
        assert_eq!(require_api_key(&model).unwrap(), None);
    }

    #[test]
    fn test_value_to_content() {
        assert_eq!(value_to_content(&serde_json::json!("plain")), "plain");
        assert_eq!(value_to_content(&serde_json::json!({"a": 1})), "{\"a\":1}");
    }
}
