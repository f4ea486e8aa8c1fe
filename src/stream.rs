//! Canonical stream events and provider-chunk normalization.
//!
//! Streaming responses arrive as provider-specific JSON chunks. A
//! [`StreamNormalizer`] turns each chunk into zero or more canonical
//! [`StreamEvent`]s; [`normalize_stream`] wraps a raw chunk stream and
//! guarantees the canonical event contract: zero or more deltas in any
//! interleaving, optionally one usage event, then exactly one terminal
//! event (a finish, or the `Err` item that ended the stream).
//!
//! # Tool-call delta reassembly
//!
//! OpenAI-style streams deliver tool-call arguments as partial JSON string
//! fragments spread across chunks, keyed by a call index:
//!
//! ```text
//! chunk 1: tool_calls[0] = { id: "call_1", function: { name: "search" } }
//! chunk 2: tool_calls[0] = { function: { arguments: "{\"q\":" } }
//! chunk 3: tool_calls[0] = { function: { arguments: " \"rust\"}" } }
//! chunk 4: finish_reason: "tool_calls"
//! ```
//!
//! The [`ToolCallAssembler`] concatenates the fragments per index and the
//! normalizer emits one complete [`StreamEvent::ToolCallDelta`] per call
//! when the finish boundary arrives, with the arguments parsed exactly
//! once.

use crate::error::Result;
use crate::types::{FinishReason, ToolCall, Usage};
use futures::stream::{Stream, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::pin::Pin;

/// A provider-agnostic streaming event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental text content.
    TextDelta(String),
    /// Incremental reasoning content; optional, never required for
    /// correctness.
    ThinkingDelta(String),
    /// A fully-assembled tool call. Emitted once per call at the finish
    /// boundary (argument fragments are concatenated internally).
    ToolCallDelta(ToolCall),
    /// Token usage reported by the provider.
    Usage(Usage),
    /// Terminal event; exactly one per successful stream.
    Finish(FinishReason),
}

/// Stream of canonical events. Errors are terminal.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Selects a built-in normalizer for a model's stream format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizerKind {
    /// OpenAI chat-completions chunks (also Groq, Ollama, vLLM, ...).
    OpenAi,
    /// Mistral's chunks: OpenAI-shaped with array-content quirks.
    Mistral,
}

impl NormalizerKind {
    pub fn instantiate(&self) -> Box<dyn StreamNormalizer> {
        match self {
            NormalizerKind::OpenAi => Box::new(OpenAiNormalizer::new()),
            NormalizerKind::Mistral => Box::new(MistralNormalizer::new()),
        }
    }
}

/// Pluggable transform from provider chunks to canonical events.
///
/// Implementations are stateful within one stream (argument reassembly)
/// and must not be reused across streams.
pub trait StreamNormalizer: Send {
    /// Turns one raw chunk into zero or more canonical events.
    fn normalize_chunk(&mut self, raw: &Value) -> Result<Vec<StreamEvent>>;

    /// True when the chunk is actually a complete non-streaming response
    /// smuggled into the stream (some gateways do this).
    fn is_complete_response(&self, raw: &Value) -> bool;

    /// Emits the equivalent deltas plus finish for a complete response.
    fn convert_complete_response(&mut self, raw: &Value) -> Result<Vec<StreamEvent>>;
}

/// Accumulates OpenAI-style tool-call deltas until the finish boundary.
///
/// Keyed by the provider-assigned call index so interleaved deltas for
/// multiple calls accumulate independently. Argument fragments may split
/// JSON at any byte position; they are only parsed on [`flush`].
///
/// [`flush`]: ToolCallAssembler::flush
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    calls: BTreeMap<u64, PartialToolCall>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorbs one entry of a `delta.tool_calls` array.
    pub fn absorb(&mut self, delta: &Value) {
        let index = delta.get("index").and_then(Value::as_u64).unwrap_or(0);
        let entry = self.calls.entry(index).or_default();

        if let Some(id) = delta.get("id").and_then(Value::as_str) {
            entry.id = Some(id.to_string());
        }
        if let Some(function) = delta.get("function") {
            if let Some(name) = function.get("name").and_then(Value::as_str) {
                entry.name = Some(name.to_string());
            }
            if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                entry.arguments.push_str(args);
            }
        }
    }

    /// Drains all assembled calls in index order, parsing each argument
    /// string once. Unparsable arguments are preserved as a raw string so
    /// the executor can surface the parse failure to the model.
    pub fn flush(&mut self) -> Vec<ToolCall> {
        let calls = std::mem::take(&mut self.calls);
        calls
            .into_values()
            .filter_map(|partial| {
                let name = partial.name?;
                let id = partial
                    .id
                    .unwrap_or_else(|| format!("call_{:08x}", rand::random::<u32>()));
                let arguments = if partial.arguments.is_empty() {
                    Value::Object(serde_json::Map::new())
                } else {
                    serde_json::from_str(&partial.arguments)
                        .unwrap_or(Value::String(partial.arguments))
                };
                Some(ToolCall::new(id, name, arguments))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Normalizer for OpenAI-style chat-completion chunks.
pub struct OpenAiNormalizer {
    assembler: ToolCallAssembler,
}

impl OpenAiNormalizer {
    pub fn new() -> Self {
        Self {
            assembler: ToolCallAssembler::new(),
        }
    }

    fn usage_from(raw: &Value) -> Option<Usage> {
        let usage = raw.get("usage")?;
        if usage.is_null() {
            return None;
        }
        let mut out = Usage::new();
        out.add_tokens(
            usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
            usage
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        );
        // Trust the provider's total when it disagrees with the sum
        // (some report cached or reasoning tokens only in the total).
        if let Some(total) = usage.get("total_tokens").and_then(Value::as_u64) {
            out.total_tokens = total;
        }
        Some(out)
    }
}

impl Default for OpenAiNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamNormalizer for OpenAiNormalizer {
    fn normalize_chunk(&mut self, raw: &Value) -> Result<Vec<StreamEvent>> {
        let mut events = Vec::new();

        if let Some(choices) = raw.get("choices").and_then(Value::as_array) {
            for choice in choices {
                let delta = choice.get("delta").cloned().unwrap_or(Value::Null);

                if let Some(content) = delta.get("content").and_then(Value::as_str) {
                    if !content.is_empty() {
                        events.push(StreamEvent::TextDelta(content.to_string()));
                    }
                }

                // Reasoning content shows up under provider-specific keys.
                for key in ["reasoning_content", "reasoning"] {
                    if let Some(thinking) = delta.get(key).and_then(Value::as_str) {
                        if !thinking.is_empty() {
                            events.push(StreamEvent::ThinkingDelta(thinking.to_string()));
                        }
                    }
                }

                if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
                    for tc in tool_calls {
                        self.assembler.absorb(tc);
                    }
                }

                if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                    for call in self.assembler.flush() {
                        events.push(StreamEvent::ToolCallDelta(call));
                    }
                    events.push(StreamEvent::Finish(FinishReason::parse(reason)));
                }
            }
        }

        // OpenAI reports usage in a final chunk with an empty choices array.
        if let Some(usage) = Self::usage_from(raw) {
            events.push(StreamEvent::Usage(usage));
        }

        Ok(events)
    }

    fn is_complete_response(&self, raw: &Value) -> bool {
        raw.get("object").and_then(Value::as_str) == Some("chat.completion")
            || raw
                .get("choices")
                .and_then(Value::as_array)
                .and_then(|c| c.first())
                .map(|c| c.get("message").is_some())
                .unwrap_or(false)
    }

    fn convert_complete_response(&mut self, raw: &Value) -> Result<Vec<StreamEvent>> {
        let mut events = Vec::new();
        let mut finish = FinishReason::Stop;

        if let Some(choice) = raw
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        {
            if let Some(message) = choice.get("message") {
                if let Some(content) = message.get("content").and_then(Value::as_str) {
                    if !content.is_empty() {
                        events.push(StreamEvent::TextDelta(content.to_string()));
                    }
                }
                if let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array) {
                    for (i, tc) in tool_calls.iter().enumerate() {
                        let mut delta = tc.clone();
                        if let Some(obj) = delta.as_object_mut() {
                            obj.entry("index").or_insert(Value::from(i as u64));
                        }
                        self.assembler.absorb(&delta);
                    }
                    for call in self.assembler.flush() {
                        events.push(StreamEvent::ToolCallDelta(call));
                    }
                }
            }
            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                finish = FinishReason::parse(reason);
            }
        }

        if let Some(usage) = Self::usage_from(raw) {
            events.push(StreamEvent::Usage(usage));
        }
        events.push(StreamEvent::Finish(finish));
        Ok(events)
    }
}

/// Normalizer for Mistral chunks.
///
/// Mistral streams the OpenAI chunk shape but may deliver `delta.content`
/// as an array of typed entries (`{"type":"text",...}` /
/// `{"type":"thinking",...}`) instead of a plain string. Entries are
/// rewritten to the plain shape and handed to the OpenAI normalizer.
pub struct MistralNormalizer {
    inner: OpenAiNormalizer,
}

impl MistralNormalizer {
    pub fn new() -> Self {
        Self {
            inner: OpenAiNormalizer::new(),
        }
    }

    fn flatten_content(raw: &Value) -> Value {
        let mut out = raw.clone();
        let Some(choices) = out.get_mut("choices").and_then(Value::as_array_mut) else {
            return out;
        };
        for choice in choices {
            let Some(delta) = choice.get_mut("delta") else {
                continue;
            };
            let Some(entries) = delta.get("content").and_then(Value::as_array).cloned() else {
                continue;
            };

            let mut text = String::new();
            let mut thinking = String::new();
            for entry in &entries {
                match entry.get("type").and_then(Value::as_str) {
                    Some("thinking") => {
                        // Thinking entries nest their own chunk list.
                        if let Some(chunks) = entry.get("thinking").and_then(Value::as_array) {
                            for chunk in chunks {
                                if let Some(t) = chunk.get("text").and_then(Value::as_str) {
                                    thinking.push_str(t);
                                }
                            }
                        }
                    }
                    _ => {
                        if let Some(t) = entry.get("text").and_then(Value::as_str) {
                            text.push_str(t);
                        }
                    }
                }
            }

            if let Some(obj) = delta.as_object_mut() {
                obj.insert("content".to_string(), Value::String(text));
                if !thinking.is_empty() {
                    obj.insert("reasoning_content".to_string(), Value::String(thinking));
                }
            }
        }
        out
    }
}

impl Default for MistralNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamNormalizer for MistralNormalizer {
    fn normalize_chunk(&mut self, raw: &Value) -> Result<Vec<StreamEvent>> {
        self.inner.normalize_chunk(&Self::flatten_content(raw))
    }

    fn is_complete_response(&self, raw: &Value) -> bool {
        self.inner.is_complete_response(raw)
    }

    fn convert_complete_response(&mut self, raw: &Value) -> Result<Vec<StreamEvent>> {
        self.inner
            .convert_complete_response(&Self::flatten_content(raw))
    }
}

/// Wraps a raw chunk stream with a normalizer, enforcing the canonical
/// event contract.
///
/// The finish event reported by the normalizer is held back and re-emitted
/// once the raw stream ends, so trailing chunks (usage reports) still
/// appear before the terminal event. If the provider never reported a
/// finish, a synthetic `Finish(Stop)` is appended. After an error item
/// nothing further is emitted.
pub fn normalize_stream(
    raw: crate::transport::RawChunkStream,
    mut normalizer: Box<dyn StreamNormalizer>,
) -> EventStream {
    use std::sync::Arc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Terminal {
        finish: Option<FinishReason>,
        errored: bool,
    }

    let terminal = Arc::new(Mutex::new(Terminal::default()));
    let terminal_body = terminal.clone();
    let terminal_tail = terminal;

    let body = raw
        .map(move |chunk_result| -> Vec<Result<StreamEvent>> {
            let mut state = match terminal_body.lock() {
                Ok(state) => state,
                Err(_) => return Vec::new(),
            };
            if state.errored {
                return Vec::new();
            }
            match chunk_result {
                Ok(chunk) => {
                    let normalized = if normalizer.is_complete_response(&chunk) {
                        normalizer.convert_complete_response(&chunk)
                    } else {
                        normalizer.normalize_chunk(&chunk)
                    };
                    match normalized {
                        Ok(events) => events
                            .into_iter()
                            .filter_map(|event| match event {
                                StreamEvent::Finish(reason) => {
                                    state.finish = Some(reason);
                                    None
                                }
                                other => Some(Ok(other)),
                            })
                            .collect(),
                        Err(err) => {
                            state.errored = true;
                            vec![Err(err)]
                        }
                    }
                }
                Err(err) => {
                    state.errored = true;
                    vec![Err(err)]
                }
            }
        })
        .flat_map(futures::stream::iter);

    let tail = futures::stream::once(async move {
        let state = terminal_tail.lock().ok()?;
        if state.errored {
            return None;
        }
        Some(Ok(StreamEvent::Finish(
            state.finish.clone().unwrap_or(FinishReason::Stop),
        )))
    })
    .filter_map(futures::future::ready);

    Box::pin(body.chain(tail))
}
