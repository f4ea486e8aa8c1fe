//! Gemini generateContent adapter.
//!
//! Gemini's shape differs the most from the chat-completions dialect:
//! messages are `contents` with roles `user`/`model`, tool schemas travel
//! as `function_declarations`, and tool calls carry no ids on the wire.
//! This adapter synthesizes unique `call_<hex>` ids when parsing so the
//! tool-result pairing invariant holds uniformly, and resolves them back
//! to function names (which `function_response` parts require) when
//! translating results out.

use super::{require_api_key, ChatModel, ChatResponse};
use crate::error::{Error, ProviderErrorKind, Result};
use crate::model::{Model, ModelSettings};
use crate::stream::{normalize_stream, EventStream, StreamEvent, StreamNormalizer};
use crate::tools::ToolDef;
use crate::transport;
use crate::types::{FinishReason, Message, Part, Role, ToolCall, Usage};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

pub struct GeminiAdapter;

fn headers(model: &Model) -> Result<Vec<(String, String)>> {
    let key = require_api_key(model)?.ok_or_else(|| {
        Error::provider(
            model.provider.as_str(),
            ProviderErrorKind::Authentication,
            None,
            "gemini requires an API key",
        )
    })?;
    Ok(vec![
        ("Content-Type".to_string(), "application/json".to_string()),
        ("x-goog-api-key".to_string(), key.to_string()),
    ])
}

fn synthesize_call_id() -> String {
    format!("call_{:08x}", rand::random::<u32>())
}

/// Maps every tool-call id in the conversation to its function name, for
/// translating `function_response` parts.
fn call_names(messages: &[Message]) -> HashMap<String, String> {
    let mut names = HashMap::new();
    for message in messages {
        for call in message.tool_calls() {
            names.insert(call.id.clone(), call.name.clone());
        }
    }
    names
}

fn part_to_gemini(part: &Part, names: &HashMap<String, String>) -> Option<Value> {
    match part {
        Part::Text { text } => Some(json!({"text": text})),
        Part::ImageUrl { url } => {
            if let Some(rest) = url.strip_prefix("data:") {
                let (mime_type, data) = rest.split_once(";base64,")?;
                Some(json!({"inline_data": {"mime_type": mime_type, "data": data}}))
            } else {
                Some(json!({"file_data": {"file_uri": url}}))
            }
        }
        Part::Audio { data, format } => Some(json!({
            "inline_data": {"mime_type": format!("audio/{}", format), "data": data},
        })),
        Part::ToolCall(call) => Some(json!({
            "function_call": {
                "name": call.name,
                "args": match &call.arguments {
                    Value::String(raw) => serde_json::from_str(raw)
                        .unwrap_or_else(|_| json!({"raw": raw})),
                    other => other.clone(),
                },
            },
        })),
        Part::ToolResult(ret) => {
            let name = names
                .get(&ret.call_id)
                .cloned()
                .unwrap_or_else(|| ret.call_id.clone());
            Some(json!({
                "function_response": {
                    "name": name,
                    "response": {"result": ret.value},
                },
            }))
        }
        // Thinking content never goes back to the provider.
        Part::Thinking { .. } => None,
    }
}

fn translate_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let names = call_names(messages);
    let mut system_parts = Vec::new();
    let mut contents = Vec::new();

    for message in messages {
        match message.role {
            Role::System => {
                let text = message.text();
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            Role::User | Role::Tool => {
                let parts: Vec<Value> = message
                    .parts
                    .iter()
                    .filter_map(|p| part_to_gemini(p, &names))
                    .collect();
                if !parts.is_empty() {
                    contents.push(json!({"role": "user", "parts": parts}));
                }
            }
            Role::Assistant => {
                let parts: Vec<Value> = message
                    .parts
                    .iter()
                    .filter_map(|p| part_to_gemini(p, &names))
                    .collect();
                if !parts.is_empty() {
                    contents.push(json!({"role": "model", "parts": parts}));
                }
            }
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, contents)
}

fn tool_config_payload(choice: &Value) -> Value {
    match choice.as_str() {
        Some("auto") => json!({"function_calling_config": {"mode": "AUTO"}}),
        Some("none") => json!({"function_calling_config": {"mode": "NONE"}}),
        Some("required") => json!({"function_calling_config": {"mode": "ANY"}}),
        Some(name) => json!({
            "function_calling_config": {"mode": "ANY", "allowed_function_names": [name]},
        }),
        None => choice.clone(),
    }
}

fn build_body(
    model: &Model,
    messages: &[Message],
    tools: &[ToolDef],
    settings: &ModelSettings,
) -> Value {
    let (system, contents) = translate_messages(messages);

    let mut body = Map::new();
    body.insert("contents".to_string(), Value::Array(contents));
    if let Some(system) = system {
        body.insert(
            "system_instruction".to_string(),
            json!({"parts": [{"text": system}]}),
        );
    }

    if !tools.is_empty() {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|def| {
                json!({
                    "name": def.name,
                    "description": def.description,
                    "parameters": def.parameters,
                })
            })
            .collect();
        body.insert(
            "tools".to_string(),
            json!([{"function_declarations": declarations}]),
        );
        if let Some(choice) = &settings.tool_choice {
            body.insert("tool_config".to_string(), tool_config_payload(choice));
        }
    }

    let mut generation = Map::new();
    if let Some(temperature) = settings.temperature {
        generation.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(max_tokens) = settings.max_tokens {
        generation.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }
    if let Some(top_p) = settings.top_p {
        generation.insert("topP".to_string(), json!(top_p));
    }
    if let Some(stop) = &settings.stop {
        generation.insert("stopSequences".to_string(), json!(stop));
    }
    // Canonical response_format maps onto Gemini's schema-constrained JSON.
    if let Some(response_format) = &settings.response_format {
        match response_format.get("type").and_then(Value::as_str) {
            Some("json_schema") => {
                generation.insert(
                    "responseMimeType".to_string(),
                    json!("application/json"),
                );
                if let Some(schema) = response_format.pointer("/json_schema/schema") {
                    generation.insert("responseSchema".to_string(), schema.clone());
                }
            }
            Some("json_object") => {
                generation.insert(
                    "responseMimeType".to_string(),
                    json!("application/json"),
                );
            }
            _ => {}
        }
    }
    if !generation.is_empty() {
        body.insert("generation_config".to_string(), Value::Object(generation));
    }

    for (key, value) in &settings.extra {
        body.insert(key.clone(), value.clone());
    }

    Value::Object(body)
}

fn parse_parts(parts: &[Value]) -> Vec<Part> {
    let mut out = Vec::new();
    for part in parts {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            if !text.is_empty() {
                out.push(Part::text(text));
            }
        }
        if let Some(call) = part.get("function_call").or_else(|| part.get("functionCall")) {
            out.push(Part::ToolCall(ToolCall::new(
                synthesize_call_id(),
                call.get("name").and_then(Value::as_str).unwrap_or_default(),
                call.get("args").cloned().unwrap_or(json!({})),
            )));
        }
    }
    out
}

fn parse_usage(raw: &Value) -> Usage {
    let mut usage = Usage::new();
    if let Some(metadata) = raw.get("usageMetadata") {
        usage.add_tokens(
            metadata
                .get("promptTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            metadata
                .get("candidatesTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        );
        if let Some(total) = metadata.get("totalTokenCount").and_then(Value::as_u64) {
            usage.total_tokens = total;
        }
    }
    usage
}

fn parse_response(model: &Model, raw: &Value) -> Result<ChatResponse> {
    let candidate = raw
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| {
            Error::stream(format!(
                "{} response has no candidates: {}",
                model.provider, raw
            ))
        })?;

    let parts = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(|parts| parse_parts(parts))
        .unwrap_or_default();

    let mut usage = parse_usage(raw);
    usage.inc_requests();

    let message = Message::assistant(parts);
    let finish = match candidate.get("finishReason").and_then(Value::as_str) {
        Some(reason) => {
            if message.has_tool_calls() {
                FinishReason::ToolCalls
            } else {
                FinishReason::parse(reason)
            }
        }
        None => FinishReason::Stop,
    };

    Ok(ChatResponse {
        message,
        usage,
        finish,
    })
}

/// Normalizes Gemini's streamGenerateContent chunks.
///
/// Chunks carry the complete-response shape with incremental parts, so the
/// same parsing applies per chunk; the finish reason arrives on the final
/// candidate.
#[derive(Default)]
pub struct GeminiNormalizer {
    finish: Option<FinishReason>,
}

impl GeminiNormalizer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamNormalizer for GeminiNormalizer {
    fn normalize_chunk(&mut self, raw: &Value) -> Result<Vec<StreamEvent>> {
        let mut events = Vec::new();
        let mut saw_tool_call = false;

        if let Some(candidate) = raw
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        {
            if let Some(parts) = candidate.pointer("/content/parts").and_then(Value::as_array) {
                for part in parse_parts(parts) {
                    match part {
                        Part::Text { text } => events.push(StreamEvent::TextDelta(text)),
                        Part::ToolCall(call) => {
                            saw_tool_call = true;
                            events.push(StreamEvent::ToolCallDelta(call));
                        }
                        _ => {}
                    }
                }
            }
            if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
                self.finish = Some(if saw_tool_call {
                    FinishReason::ToolCalls
                } else {
                    FinishReason::parse(reason)
                });
            }
        }

        if raw.get("usageMetadata").is_some() {
            let usage = parse_usage(raw);
            if usage.total_tokens > 0 {
                events.push(StreamEvent::Usage(usage));
            }
        }

        // The last chunk carries the finish reason; emit it so the stream
        // wrapper can hold it until the raw stream ends.
        if let Some(reason) = self.finish.take() {
            events.push(StreamEvent::Finish(reason));
        }

        Ok(events)
    }

    fn is_complete_response(&self, _raw: &Value) -> bool {
        // Stream chunks share the complete-response shape; normalize_chunk
        // handles both.
        false
    }

    fn convert_complete_response(&mut self, raw: &Value) -> Result<Vec<StreamEvent>> {
        self.normalize_chunk(raw)
    }
}

#[async_trait]
impl ChatModel for GeminiAdapter {
    async fn request(
        &self,
        model: &Model,
        messages: &[Message],
        tools: &[ToolDef],
        settings: &ModelSettings,
    ) -> Result<ChatResponse> {
        let headers = headers(model)?;
        let body = build_body(model, messages, tools, settings);
        let url = format!("{}/models/{}:generateContent", model.base_url, model.name);
        let raw = transport::post_json(
            model.provider.as_str(),
            &url,
            &headers,
            &body,
            model.timeout,
        )
        .await?;
        parse_response(model, &raw)
    }

    async fn request_stream(
        &self,
        model: &Model,
        messages: &[Message],
        tools: &[ToolDef],
        settings: &ModelSettings,
    ) -> Result<EventStream> {
        let headers = headers(model)?;
        let body = build_body(model, messages, tools, settings);
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            model.base_url, model.name
        );
        let raw = transport::post_sse(
            model.provider.as_str(),
            &url,
            &headers,
            &body,
            model.timeout,
        )
        .await?;
        Ok(normalize_stream(raw, Box::new(GeminiNormalizer::new())))
    }
}
