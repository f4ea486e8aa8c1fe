//! OpenAI-compatible chat-completions adapter.
//!
//! Serves every provider that speaks the `/chat/completions` dialect. The
//! builders here are shared with the Mistral adapter, which layers its own
//! quirks on the same shape.

use super::{require_api_key, value_to_content, ChatModel, ChatResponse};
use crate::error::Result;
use crate::model::{Model, ModelSettings};
use crate::stream::{normalize_stream, EventStream};
use crate::tools::ToolDef;
use crate::transport;
use crate::types::{FinishReason, Message, Part, Role, ToolCall, Usage};
use async_trait::async_trait;
use serde_json::{json, Map, Value};

pub struct OpenAiAdapter;

/// Builds the request headers: bearer auth when a key is configured, plus
/// the optional organization header.
pub(crate) fn headers(model: &Model) -> Result<Vec<(String, String)>> {
    let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
    if let Some(key) = require_api_key(model)? {
        headers.push(("Authorization".to_string(), format!("Bearer {}", key)));
    }
    if let Some(org) = &model.organization {
        headers.push(("OpenAI-Organization".to_string(), org.clone()));
    }
    Ok(headers)
}

/// Translates canonical messages to the chat-completions message array.
///
/// Tool results become `role: "tool"` messages carrying `tool_call_id`;
/// assistant tool calls are re-serialized with their original ids so a
/// round trip through this adapter preserves call identity.
pub(crate) fn translate_messages(messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::new();
    for message in messages {
        match message.role {
            Role::System => {
                out.push(json!({"role": "system", "content": message.text()}));
            }
            Role::User => {
                let only_text = message
                    .parts
                    .iter()
                    .all(|p| matches!(p, Part::Text { .. }));
                if only_text {
                    out.push(json!({"role": "user", "content": message.text()}));
                } else {
                    let content: Vec<Value> = message
                        .parts
                        .iter()
                        .filter_map(|part| match part {
                            Part::Text { text } => Some(json!({"type": "text", "text": text})),
                            Part::ImageUrl { url } => {
                                Some(json!({"type": "image_url", "image_url": {"url": url}}))
                            }
                            Part::Audio { data, format } => Some(json!({
                                "type": "input_audio",
                                "input_audio": {"data": data, "format": format},
                            })),
                            _ => None,
                        })
                        .collect();
                    out.push(json!({"role": "user", "content": content}));
                }
            }
            Role::Assistant => {
                let text = message.text();
                let mut entry = Map::new();
                entry.insert("role".to_string(), json!("assistant"));
                entry.insert(
                    "content".to_string(),
                    if text.is_empty() { Value::Null } else { json!(text) },
                );
                let calls = message.tool_calls();
                if !calls.is_empty() {
                    let tool_calls: Vec<Value> = calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": arguments_to_string(&call.arguments),
                                },
                            })
                        })
                        .collect();
                    entry.insert("tool_calls".to_string(), Value::Array(tool_calls));
                }
                out.push(Value::Object(entry));
            }
            Role::Tool => {
                for ret in message.tool_returns() {
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": ret.call_id,
                        "content": value_to_content(&ret.value),
                    }));
                }
            }
        }
    }
    out
}

fn arguments_to_string(arguments: &Value) -> String {
    match arguments {
        // Raw string arguments (from an unparsable stream) go back verbatim
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Tool definitions in the `function` wrapper format.
pub(crate) fn tools_payload(tools: &[ToolDef]) -> Vec<Value> {
    tools
        .iter()
        .map(|def| {
            json!({
                "type": "function",
                "function": {
                    "name": def.name,
                    "description": def.description,
                    "parameters": def.parameters,
                },
            })
        })
        .collect()
}

/// Canonical tool_choice to this dialect: keywords pass through, a bare
/// tool name becomes a forced function selection.
pub(crate) fn tool_choice_payload(choice: &Value) -> Value {
    match choice.as_str() {
        Some("auto") | Some("none") | Some("required") => choice.clone(),
        Some(name) => json!({"type": "function", "function": {"name": name}}),
        None => choice.clone(),
    }
}

/// Assembles the request body shared by all OpenAI-compatible providers.
pub(crate) fn build_body(
    model: &Model,
    messages: &[Message],
    tools: &[ToolDef],
    settings: &ModelSettings,
    stream: bool,
) -> Value {
    let mut body = Map::new();
    body.insert("model".to_string(), json!(model.name));
    body.insert(
        "messages".to_string(),
        Value::Array(translate_messages(messages)),
    );

    if let Some(temperature) = settings.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(max_tokens) = settings.max_tokens {
        body.insert("max_tokens".to_string(), json!(max_tokens));
    }
    if let Some(top_p) = settings.top_p {
        body.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(stop) = &settings.stop {
        body.insert("stop".to_string(), json!(stop));
    }
    if let Some(response_format) = &settings.response_format {
        body.insert("response_format".to_string(), response_format.clone());
    }

    if !tools.is_empty() {
        body.insert("tools".to_string(), Value::Array(tools_payload(tools)));
        if let Some(choice) = &settings.tool_choice {
            body.insert("tool_choice".to_string(), tool_choice_payload(choice));
        }
    }

    // Provider-specific passthrough (vLLM guided_choice / guided_regex /
    // guided_grammar, sampling extensions, ...).
    for (key, value) in &settings.extra {
        body.insert(key.clone(), value.clone());
    }

    if stream {
        body.insert("stream".to_string(), json!(true));
        body.insert("stream_options".to_string(), json!({"include_usage": true}));
    }

    Value::Object(body)
}

/// Parses a non-streaming chat-completions response into canonical form.
pub(crate) fn parse_response(model: &Model, raw: &Value) -> Result<ChatResponse> {
    let choice = raw
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| {
            crate::Error::stream(format!(
                "{} response has no choices: {}",
                model.provider, raw
            ))
        })?;

    let message = choice.get("message").cloned().unwrap_or(Value::Null);
    let mut parts = Vec::new();

    for key in ["reasoning_content", "reasoning"] {
        if let Some(thinking) = message.get(key).and_then(Value::as_str) {
            if !thinking.is_empty() {
                parts.push(Part::Thinking {
                    content: thinking.to_string(),
                });
            }
        }
    }

    if let Some(content) = message.get("content").and_then(Value::as_str) {
        if !content.is_empty() {
            parts.push(Part::text(content));
        }
    }

    if let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array) {
        for tc in tool_calls {
            let id = tc
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{:08x}", rand::random::<u32>()));
            let function = tc.get("function").cloned().unwrap_or(Value::Null);
            let name = function
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let arguments = match function.get("arguments") {
                Some(Value::String(raw_args)) if !raw_args.is_empty() => {
                    serde_json::from_str(raw_args)
                        .unwrap_or_else(|_| Value::String(raw_args.clone()))
                }
                Some(Value::Object(obj)) => Value::Object(obj.clone()),
                _ => Value::Object(Map::new()),
            };
            parts.push(Part::ToolCall(ToolCall::new(id, name, arguments)));
        }
    }

    let mut usage = Usage::new();
    usage.inc_requests();
    if let Some(raw_usage) = raw.get("usage") {
        usage.add_tokens(
            raw_usage
                .get("prompt_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            raw_usage
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        );
        if let Some(total) = raw_usage.get("total_tokens").and_then(Value::as_u64) {
            usage.total_tokens = total;
        }
    }

    let finish = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(FinishReason::parse)
        .unwrap_or(FinishReason::Stop);

    Ok(ChatResponse {
        message: Message::assistant(parts),
        usage,
        finish,
    })
}

#[async_trait]
impl ChatModel for OpenAiAdapter {
    async fn request(
        &self,
        model: &Model,
        messages: &[Message],
        tools: &[ToolDef],
        settings: &ModelSettings,
    ) -> Result<ChatResponse> {
        let headers = headers(model)?;
        let body = build_body(model, messages, tools, settings, false);
        let url = format!("{}/chat/completions", model.base_url);
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
        let body = build_body(model, messages, tools, settings, true);
        let url = format!("{}/chat/completions", model.base_url);
        let raw = transport::post_sse(
            model.provider.as_str(),
            &url,
            &headers,
            &body,
            model.timeout,
        )
        .await?;
        Ok(normalize_stream(raw, model.normalizer.instantiate()))
    }
}
