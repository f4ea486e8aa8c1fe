//! Anthropic Messages API adapter.
//!
//! Differences from the OpenAI dialect handled here: the system prompt is
//! extracted (and consecutive system messages concatenated) into the
//! top-level `system` field; tool calls and results travel as `tool_use` /
//! `tool_result` content blocks; auth uses `x-api-key`; and the stream is
//! event-typed, so this adapter normalizes it to canonical events directly
//! instead of going through the OpenAI-style normalizer.
//!
//! Extended features honored from `settings.extra`:
//! - `thinking`: passed through as the `thinking` request field
//!   (`{"type": "enabled", "budget_tokens": n}`).
//! - `context_1m`: adds the 1M-context beta header.

use super::{require_api_key, ChatModel, ChatResponse};
use crate::error::{Error, ProviderErrorKind, Result};
use crate::model::{Model, ModelSettings};
use crate::stream::{normalize_stream, EventStream, StreamEvent, StreamNormalizer};
use crate::tools::ToolDef;
use crate::transport;
use crate::types::{FinishReason, Message, Part, Role, ToolCall, Usage};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

const API_VERSION: &str = "2023-06-01";
const CONTEXT_1M_BETA: &str = "context-1m-2025-08-07";

// Anthropic requires max_tokens; applied when the caller set none.
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicAdapter;

fn headers(model: &Model, settings: &ModelSettings) -> Result<Vec<(String, String)>> {
    let key = require_api_key(model)?.ok_or_else(|| {
        Error::provider(
            model.provider.as_str(),
            ProviderErrorKind::Authentication,
            None,
            "anthropic requires an API key",
        )
    })?;
    let mut headers = vec![
        ("Content-Type".to_string(), "application/json".to_string()),
        ("x-api-key".to_string(), key.to_string()),
        ("anthropic-version".to_string(), API_VERSION.to_string()),
    ];
    if settings
        .extra
        .get("context_1m")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        headers.push(("anthropic-beta".to_string(), CONTEXT_1M_BETA.to_string()));
    }
    Ok(headers)
}

fn part_to_block(part: &Part) -> Option<Value> {
    match part {
        Part::Text { text } => Some(json!({"type": "text", "text": text})),
        Part::Thinking { content } => Some(json!({"type": "thinking", "thinking": content})),
        Part::ToolCall(call) => Some(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": match &call.arguments {
                Value::String(raw) => serde_json::from_str(raw)
                    .unwrap_or_else(|_| json!({"raw": raw})),
                other => other.clone(),
            },
        })),
        Part::ImageUrl { url } => {
            // Data URIs become base64 sources, everything else a URL source.
            if let Some(rest) = url.strip_prefix("data:") {
                let (media_type, data) = rest.split_once(";base64,")?;
                Some(json!({
                    "type": "image",
                    "source": {"type": "base64", "media_type": media_type, "data": data},
                }))
            } else {
                Some(json!({
                    "type": "image",
                    "source": {"type": "url", "url": url},
                }))
            }
        }
        Part::Audio { .. } => {
            log::debug!("dropping audio part: the messages API has no audio input");
            None
        }
        Part::ToolResult(_) => None,
    }
}

/// Splits canonical messages into the top-level system string and the
/// alternating user/assistant message array.
///
/// Consecutive system messages concatenate; consecutive same-role entries
/// (tool results arriving back-to-back) merge into one message, which the
/// API requires.
fn translate_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system_parts: Vec<String> = Vec::new();
    let mut translated: Vec<(String, Vec<Value>)> = Vec::new();

    let mut push_blocks = |role: &str, blocks: Vec<Value>| {
        if blocks.is_empty() {
            return;
        }
        match translated.last_mut() {
            Some((last_role, last_blocks)) if last_role == role => {
                last_blocks.extend(blocks);
            }
            _ => translated.push((role.to_string(), blocks)),
        }
    };

    for message in messages {
        match message.role {
            Role::System => {
                let text = message.text();
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            Role::User => {
                let blocks = message.parts.iter().filter_map(part_to_block).collect();
                push_blocks("user", blocks);
            }
            Role::Assistant => {
                let blocks = message.parts.iter().filter_map(part_to_block).collect();
                push_blocks("assistant", blocks);
            }
            Role::Tool => {
                let blocks: Vec<Value> = message
                    .tool_returns()
                    .iter()
                    .map(|ret| {
                        json!({
                            "type": "tool_result",
                            "tool_use_id": ret.call_id,
                            "content": super::value_to_content(&ret.value),
                        })
                    })
                    .collect();
                push_blocks("user", blocks);
            }
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    let messages = translated
        .into_iter()
        .map(|(role, content)| json!({"role": role, "content": content}))
        .collect();
    (system, messages)
}

fn tools_payload(tools: &[ToolDef]) -> Vec<Value> {
    tools
        .iter()
        .map(|def| {
            json!({
                "name": def.name,
                "description": def.description,
                "input_schema": def.parameters,
            })
        })
        .collect()
}

fn tool_choice_payload(choice: &Value) -> Value {
    match choice.as_str() {
        Some("auto") => json!({"type": "auto"}),
        Some("none") => json!({"type": "none"}),
        Some("required") => json!({"type": "any"}),
        Some(name) => json!({"type": "tool", "name": name}),
        None => choice.clone(),
    }
}

fn build_body(
    model: &Model,
    messages: &[Message],
    tools: &[ToolDef],
    settings: &ModelSettings,
    stream: bool,
) -> Value {
    let (system, translated) = translate_messages(messages);

    let mut body = Map::new();
    body.insert("model".to_string(), json!(model.name));
    body.insert(
        "max_tokens".to_string(),
        json!(settings.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
    );
    body.insert("messages".to_string(), Value::Array(translated));
    if let Some(system) = system {
        body.insert("system".to_string(), json!(system));
    }
    if let Some(temperature) = settings.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = settings.top_p {
        body.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(stop) = &settings.stop {
        body.insert("stop_sequences".to_string(), json!(stop));
    }
    if !tools.is_empty() {
        body.insert("tools".to_string(), Value::Array(tools_payload(tools)));
        if let Some(choice) = &settings.tool_choice {
            body.insert("tool_choice".to_string(), tool_choice_payload(choice));
        }
    }
    if let Some(thinking) = settings.extra.get("thinking") {
        body.insert("thinking".to_string(), thinking.clone());
    }
    for (key, value) in &settings.extra {
        if key == "thinking" || key == "context_1m" {
            continue;
        }
        body.insert(key.clone(), value.clone());
    }
    if stream {
        body.insert("stream".to_string(), json!(true));
    }
    Value::Object(body)
}

fn parse_response(model: &Model, raw: &Value) -> Result<ChatResponse> {
    let content = raw
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            Error::stream(format!("{} response has no content: {}", model.provider, raw))
        })?;

    let mut parts = Vec::new();
    for block in content {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    parts.push(Part::text(text));
                }
            }
            Some("thinking") => {
                if let Some(thinking) = block.get("thinking").and_then(Value::as_str) {
                    parts.push(Part::Thinking {
                        content: thinking.to_string(),
                    });
                }
            }
            Some("tool_use") => {
                parts.push(Part::ToolCall(ToolCall::new(
                    block.get("id").and_then(Value::as_str).unwrap_or_default(),
                    block.get("name").and_then(Value::as_str).unwrap_or_default(),
                    block.get("input").cloned().unwrap_or(json!({})),
                )));
            }
            _ => {}
        }
    }

    let mut usage = Usage::new();
    usage.inc_requests();
    if let Some(raw_usage) = raw.get("usage") {
        usage.add_tokens(
            raw_usage
                .get("input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            raw_usage
                .get("output_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        );
    }

    let finish = raw
        .get("stop_reason")
        .and_then(Value::as_str)
        .map(FinishReason::parse)
        .unwrap_or(FinishReason::Stop);

    Ok(ChatResponse {
        message: Message::assistant(parts),
        usage,
        finish,
    })
}

/// Normalizes Anthropic's event-typed SSE stream to canonical events.
///
/// Tool-call input arrives as `input_json_delta` fragments per content
/// block; they are concatenated and parsed when the block stops.
#[derive(Default)]
pub struct AnthropicNormalizer {
    input_tokens: u64,
    blocks: BTreeMap<u64, PartialBlock>,
    stop_reason: Option<FinishReason>,
}

#[derive(Debug)]
struct PartialBlock {
    id: String,
    name: String,
    json: String,
}

impl AnthropicNormalizer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamNormalizer for AnthropicNormalizer {
    fn normalize_chunk(&mut self, raw: &Value) -> Result<Vec<StreamEvent>> {
        let mut events = Vec::new();
        match raw.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                self.input_tokens = raw
                    .pointer("/message/usage/input_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
            }
            Some("content_block_start") => {
                let index = raw.get("index").and_then(Value::as_u64).unwrap_or(0);
                if let Some(block) = raw.get("content_block") {
                    if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                        self.blocks.insert(
                            index,
                            PartialBlock {
                                id: block
                                    .get("id")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_string(),
                                name: block
                                    .get("name")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_string(),
                                json: String::new(),
                            },
                        );
                    }
                }
            }
            Some("content_block_delta") => {
                let index = raw.get("index").and_then(Value::as_u64).unwrap_or(0);
                if let Some(delta) = raw.get("delta") {
                    match delta.get("type").and_then(Value::as_str) {
                        Some("text_delta") => {
                            if let Some(text) = delta.get("text").and_then(Value::as_str) {
                                events.push(StreamEvent::TextDelta(text.to_string()));
                            }
                        }
                        Some("thinking_delta") => {
                            if let Some(thinking) = delta.get("thinking").and_then(Value::as_str) {
                                events.push(StreamEvent::ThinkingDelta(thinking.to_string()));
                            }
                        }
                        Some("input_json_delta") => {
                            if let Some(fragment) =
                                delta.get("partial_json").and_then(Value::as_str)
                            {
                                if let Some(block) = self.blocks.get_mut(&index) {
                                    block.json.push_str(fragment);
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            Some("content_block_stop") => {
                let index = raw.get("index").and_then(Value::as_u64).unwrap_or(0);
                if let Some(block) = self.blocks.remove(&index) {
                    let arguments = if block.json.is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&block.json)
                            .unwrap_or(Value::String(block.json))
                    };
                    events.push(StreamEvent::ToolCallDelta(ToolCall::new(
                        block.id, block.name, arguments,
                    )));
                }
            }
            Some("message_delta") => {
                if let Some(reason) = raw.pointer("/delta/stop_reason").and_then(Value::as_str) {
                    self.stop_reason = Some(FinishReason::parse(reason));
                }
                if let Some(output) = raw.pointer("/usage/output_tokens").and_then(Value::as_u64) {
                    let mut usage = Usage::new();
                    usage.add_tokens(self.input_tokens, output);
                    events.push(StreamEvent::Usage(usage));
                }
            }
            Some("message_stop") => {
                events.push(StreamEvent::Finish(
                    self.stop_reason.take().unwrap_or(FinishReason::Stop),
                ));
            }
            // ping and unknown event types carry nothing
            _ => {}
        }
        Ok(events)
    }

    fn is_complete_response(&self, raw: &Value) -> bool {
        raw.get("type").and_then(Value::as_str) == Some("message")
            && raw.get("content").map(Value::is_array).unwrap_or(false)
    }

    fn convert_complete_response(&mut self, raw: &Value) -> Result<Vec<StreamEvent>> {
        let mut events = Vec::new();
        if let Some(content) = raw.get("content").and_then(Value::as_array) {
            for block in content {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            events.push(StreamEvent::TextDelta(text.to_string()));
                        }
                    }
                    Some("thinking") => {
                        if let Some(thinking) = block.get("thinking").and_then(Value::as_str) {
                            events.push(StreamEvent::ThinkingDelta(thinking.to_string()));
                        }
                    }
                    Some("tool_use") => {
                        events.push(StreamEvent::ToolCallDelta(ToolCall::new(
                            block.get("id").and_then(Value::as_str).unwrap_or_default(),
                            block.get("name").and_then(Value::as_str).unwrap_or_default(),
                            block.get("input").cloned().unwrap_or(json!({})),
                        )));
                    }
                    _ => {}
                }
            }
        }
        if let Some(raw_usage) = raw.get("usage") {
            let mut usage = Usage::new();
            usage.add_tokens(
                raw_usage
                    .get("input_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                raw_usage
                    .get("output_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            );
            events.push(StreamEvent::Usage(usage));
        }
        events.push(StreamEvent::Finish(
            raw.get("stop_reason")
                .and_then(Value::as_str)
                .map(FinishReason::parse)
                .unwrap_or(FinishReason::Stop),
        ));
        Ok(events)
    }
}

#[async_trait]
impl ChatModel for AnthropicAdapter {
    async fn request(
        &self,
        model: &Model,
        messages: &[Message],
        tools: &[ToolDef],
        settings: &ModelSettings,
    ) -> Result<ChatResponse> {
        let headers = headers(model, settings)?;
        let body = build_body(model, messages, tools, settings, false);
        let url = format!("{}/messages", model.base_url);
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
        let headers = headers(model, settings)?;
        let body = build_body(model, messages, tools, settings, true);
        let url = format!("{}/messages", model.base_url);
        let raw = transport::post_sse(
            model.provider.as_str(),
            &url,
            &headers,
            &body,
            model.timeout,
        )
        .await?;
        Ok(normalize_stream(raw, Box::new(AnthropicNormalizer::new())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> Model {
        Model::builder("anthropic:claude-sonnet-4-5")
            .unwrap()
            .api_key("sk-ant-test")
            .build()
            .unwrap()
    }

    #[test]
    fn test_system_prompt_extraction_and_concatenation() {
        let messages = vec![
            Message::system("You are terse."),
            Message::system("Answer in French."),
            Message::user("Bonjour?"),
        ];
        let (system, translated) = translate_messages(&messages);
        assert_eq!(system.unwrap(), "You are terse.\n\nAnswer in French.");
        assert_eq!(translated.len(), 1);
        assert_eq!(translated[0]["role"], "user");
    }

    #[test]
    fn test_tool_round_trip_as_content_blocks() {
        let messages = vec![
            Message::assistant(vec![Part::ToolCall(ToolCall::new(
                "toolu_1",
                "add",
                json!({"a": 1, "b": 2}),
            ))]),
            Message::tool_result("toolu_1", json!({"result": 3})),
        ];
        let (_, translated) = translate_messages(&messages);
        assert_eq!(translated[0]["content"][0]["type"], "tool_use");
        assert_eq!(translated[0]["content"][0]["id"], "toolu_1");
        assert_eq!(translated[1]["role"], "user");
        assert_eq!(translated[1]["content"][0]["type"], "tool_result");
        assert_eq!(translated[1]["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn test_consecutive_tool_results_merge_into_one_user_message() {
        let messages = vec![
            Message::tool_result("toolu_1", json!("a")),
            Message::tool_result("toolu_2", json!("b")),
        ];
        let (_, translated) = translate_messages(&messages);
        assert_eq!(translated.len(), 1);
        assert_eq!(translated[0]["content"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_base64_image_source() {
        let messages = vec![Message::user_with_parts(vec![Part::image_url(
            "data:image/png;base64,aGVsbG8=",
        )])];
        let (_, translated) = translate_messages(&messages);
        let source = &translated[0]["content"][0]["source"];
        assert_eq!(source["type"], "base64");
        assert_eq!(source["media_type"], "image/png");
        assert_eq!(source["data"], "aGVsbG8=");
    }

    #[test]
    fn test_build_body_tool_schema_dialect() {
        let def = ToolDef {
            name: "add".to_string(),
            description: "Add numbers".to_string(),
            parameters: json!({"type": "object", "properties": {}, "required": []}),
        };
        let mut settings = ModelSettings::new();
        settings.tool_choice = Some(json!("add"));
        let body = build_body(&model(), &[Message::user("go")], &[def], &settings, false);

        assert_eq!(body["tools"][0]["name"], "add");
        assert!(body["tools"][0].get("input_schema").is_some());
        assert_eq!(body["tool_choice"], json!({"type": "tool", "name": "add"}));
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_thinking_and_beta_flag() {
        let mut settings = ModelSettings::new();
        settings.extra.insert(
            "thinking".to_string(),
            json!({"type": "enabled", "budget_tokens": 2048}),
        );
        settings.extra.insert("context_1m".to_string(), json!(true));

        let body = build_body(&model(), &[Message::user("hi")], &[], &settings, false);
        assert_eq!(body["thinking"]["budget_tokens"], 2048);
        assert!(body.get("context_1m").is_none());

        let headers = headers(&model(), &settings).unwrap();
        assert!(headers
            .iter()
            .any(|(k, v)| k == "anthropic-beta" && v == CONTEXT_1M_BETA));
        assert!(headers.iter().any(|(k, _)| k == "x-api-key"));
    }

    #[test]
    fn test_parse_response_blocks() {
        let raw = json!({
            "type": "message",
            "content": [
                {"type": "thinking", "thinking": "let me add"},
                {"type": "text", "text": "The answer is 3."},
                {"type": "tool_use", "id": "toolu_9", "name": "add", "input": {"a": 1, "b": 2}},
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 20, "output_tokens": 10},
        });
        let response = parse_response(&model(), &raw).unwrap();
        assert_eq!(response.message.text(), "The answer is 3.");
        assert_eq!(response.message.tool_calls()[0].id, "toolu_9");
        assert_eq!(response.finish, FinishReason::ToolCalls);
        assert_eq!(response.usage.total_tokens, 30);
    }

    #[test]
    fn test_normalizer_event_typed_stream() {
        let mut normalizer = AnthropicNormalizer::new();
        let chunks = [
            json!({"type": "message_start", "message": {"usage": {"input_tokens": 25}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text"}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hi"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "search"}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"q\":"}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "\"rust\"}"}}),
            json!({"type": "content_block_stop", "index": 1}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 7}}),
            json!({"type": "message_stop"}),
        ];

        let mut events = Vec::new();
        for chunk in &chunks {
            events.extend(normalizer.normalize_chunk(chunk).unwrap());
        }

        assert!(events.contains(&StreamEvent::TextDelta("Hi".to_string())));
        let call = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::ToolCallDelta(c) => Some(c),
                _ => None,
            })
            .unwrap();
        assert_eq!(call.name, "search");
        assert_eq!(call.arguments, json!({"q": "rust"}));
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Usage(u) if u.total_tokens == 32)));
        assert_eq!(
            events.last().unwrap(),
            &StreamEvent::Finish(FinishReason::ToolCalls)
        );
    }

    #[test]
    fn test_missing_key_is_authentication_error() {
        std::env::remove_var("ANTHROPIC_API_KEY");
        let model = Model::parse("anthropic:claude-sonnet-4-5").unwrap();
        let err = headers(&model, &ModelSettings::new()).unwrap_err();
        assert_eq!(err.code(), "provider_error/authentication");
    }
}
