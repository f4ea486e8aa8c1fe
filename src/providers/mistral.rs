//! Mistral chat adapter.
//!
//! Mistral speaks the chat-completions shape, so request assembly and
//! response parsing are shared with the OpenAI adapter. What differs:
//! streamed content may arrive as typed arrays (handled by the Mistral
//! normalizer, the model's default), and a few Mistral-only request fields
//! are honored from `settings.extra`: `safe_prompt`, `prediction`, and
//! `reasoning` all pass through top-level.

use super::{openai, ChatModel, ChatResponse};
use crate::error::Result;
use crate::model::{Model, ModelSettings};
use crate::stream::{normalize_stream, EventStream};
use crate::tools::ToolDef;
use crate::transport;
use crate::types::Message;
use async_trait::async_trait;

pub struct MistralAdapter;

#[async_trait]
impl ChatModel for MistralAdapter {
    async fn request(
        &self,
        model: &Model,
        messages: &[Message],
        tools: &[ToolDef],
        settings: &ModelSettings,
    ) -> Result<ChatResponse> {
        let headers = openai::headers(model)?;
        let body = openai::build_body(model, messages, tools, settings, false);
        let url = format!("{}/chat/completions", model.base_url);
        let raw = transport::post_json(
            model.provider.as_str(),
            &url,
            &headers,
            &body,
            model.timeout,
        )
        .await?;
        openai::parse_response(model, &raw)
    }

    async fn request_stream(
        &self,
        model: &Model,
        messages: &[Message],
        tools: &[ToolDef],
        settings: &ModelSettings,
    ) -> Result<EventStream> {
        let headers = openai::headers(model)?;
        let body = openai::build_body(model, messages, tools, settings, true);
        let url = format!("{}/chat/completions", model.base_url);
        let raw = transport::post_sse(
            model.provider.as_str(),
            &url,
            &headers,
            &body,
            model.timeout,
        )
        .await?;
        // The model's default normalizer is the Mistral one; an explicit
        // override on the Model is respected.
        Ok(normalize_stream(raw, model.normalizer.instantiate()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::NormalizerKind;
    use serde_json::json;

    #[test]
    fn test_mistral_extras_pass_through() {
        let model = Model::builder("mistral:mistral-large-latest")
            .unwrap()
            .api_key("test")
            .build()
            .unwrap();
        let mut settings = ModelSettings::new();
        settings.extra.insert("safe_prompt".to_string(), json!(true));
        settings
            .extra
            .insert("prediction".to_string(), json!({"type": "content", "content": "4"}));

        let body = openai::build_body(&model, &[Message::user("2+2?")], &[], &settings, false);
        assert_eq!(body["safe_prompt"], true);
        assert_eq!(body["prediction"]["content"], "4");
    }

    #[test]
    fn test_mistral_default_normalizer() {
        let model = Model::builder("mistral:mistral-large-latest")
            .unwrap()
            .api_key("test")
            .build()
            .unwrap();
        assert_eq!(model.normalizer, NormalizerKind::Mistral);
    }
}
