//! Canonical message and usage types.
//!
//! Every provider adapter translates to and from the types in this module,
//! so the rest of the runtime (runner, behaviours, evaluators) never sees a
//! provider wire format. A message is an ordered sequence of role-tagged
//! [`Part`]s; tool-call identity survives the round trip through any
//! adapter: extracting the tool calls of an adapter-produced message and
//! sending them back reproduces the same `id`/`name`/`arguments` triple.
//!
//! # Example
//!
//! ```
//! use agentry::{Message, Part, Role};
//!
//! let msg = Message::user("What's the weather in Paris?");
//! assert!(matches!(msg.role, Role::User));
//! assert_eq!(msg.text(), "What's the weather in Paris?");
//! ```

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifies the sender of a message in the conversation.
///
/// Serializes to lowercase strings (`"system"`, `"user"`, ...) matching the
/// role vocabulary shared by the supported chat APIs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions and constraints that apply to the whole conversation.
    System,
    /// Input from the human or calling application.
    User,
    /// Response from the model; may carry text, thinking, and tool calls.
    Assistant,
    /// Result of a tool execution, fed back to the model.
    Tool,
}

/// A tool invocation requested by the model.
///
/// `arguments` normally holds the parsed JSON object. When a provider
/// delivered an argument string that is not valid JSON, the adapter stores
/// the raw text as `Value::String` and the executor surfaces the parse
/// failure to the model as the tool's result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Unique identifier within the run, used to pair the result.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// Arguments to pass to the tool.
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// The outcome of a tool invocation, paired to its call by `call_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolReturn {
    /// `id` of the [`ToolCall`] this result answers.
    pub call_id: String,
    /// Result value sent back to the model.
    pub value: Value,
}

/// Content blocks that make up a [`Message`].
///
/// Serialized with an external `"type"` tag:
///
/// ```json
/// {"type": "text", "text": "Hello"}
/// {"type": "tool_call", "id": "call_1", "name": "add", "arguments": {"a": 1}}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    /// Plain text.
    Text { text: String },
    /// Image by URL or data URI.
    ImageUrl { url: String },
    /// Inline audio, base64-encoded, with its container format ("wav", "mp3").
    Audio { data: String, format: String },
    /// Tool invocation requested by the assistant.
    ToolCall(ToolCall),
    /// Tool result; only valid in `Role::Tool` messages.
    ToolResult(ToolReturn),
    /// Opaque reasoning content. Optional; never required for correctness.
    Thinking { content: String },
}

impl Part {
    /// Text part from any string-like value.
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    /// Image part from an http(s) URL or data URI.
    pub fn image_url(url: impl Into<String>) -> Self {
        Part::ImageUrl { url: url.into() }
    }

    /// Image part from raw bytes, encoded as a base64 data URI.
    pub fn image_bytes(bytes: &[u8], mime_type: &str) -> Self {
        let data = base64::engine::general_purpose::STANDARD.encode(bytes);
        Part::ImageUrl {
            url: format!("data:{};base64,{}", mime_type, data),
        }
    }

    /// Audio part from raw bytes and a container format such as "wav".
    pub fn audio_bytes(bytes: &[u8], format: impl Into<String>) -> Self {
        Part::Audio {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            format: format.into(),
        }
    }
}

/// A complete message in a conversation: a role plus ordered content parts.
///
/// Invariants maintained by the runtime: every [`Part::ToolResult`]
/// references the id of a `tool_call` emitted by an earlier assistant
/// message of the same run, and messages form a total order of production.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Message {
    /// Creates a message with the given role and parts.
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    /// System message with a single text part.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![Part::text(text)])
    }

    /// User message with a single text part.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    /// User message with arbitrary parts (text + images + audio).
    pub fn user_with_parts(parts: Vec<Part>) -> Self {
        Self::new(Role::User, parts)
    }

    /// Assistant message with the given parts.
    pub fn assistant(parts: Vec<Part>) -> Self {
        Self::new(Role::Assistant, parts)
    }

    /// Assistant message with a single text part.
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![Part::text(text)])
    }

    /// Tool message carrying one tool result.
    pub fn tool_result(call_id: impl Into<String>, value: Value) -> Self {
        Self::new(
            Role::Tool,
            vec![Part::ToolResult(ToolReturn {
                call_id: call_id.into(),
                value,
            })],
        )
    }

    /// Concatenation of all text parts, in order.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let Part::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }

    /// Tool calls carried by this message, in emission order.
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    /// Whether this message carries at least one tool call.
    pub fn has_tool_calls(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::ToolCall(_)))
    }

    /// Tool results carried by this message.
    pub fn tool_returns(&self) -> Vec<&ToolReturn> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolResult(ret) => Some(ret),
                _ => None,
            })
            .collect()
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural completion.
    Stop,
    /// The model wants tools executed.
    ToolCalls,
    /// Hit the max_tokens limit.
    Length,
    /// Output was filtered.
    ContentFilter,
    /// Provider-specific reason preserved verbatim.
    Other(String),
}

impl FinishReason {
    /// Maps the finish-reason vocabulary of the supported providers onto
    /// the canonical variants.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "stop" | "end_turn" | "STOP" | "eos" => FinishReason::Stop,
            "tool_calls" | "tool_use" | "function_call" => FinishReason::ToolCalls,
            "length" | "max_tokens" | "MAX_TOKENS" => FinishReason::Length,
            "content_filter" | "SAFETY" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Other(s) => s,
        }
    }
}

/// Token and request accounting, summed across model requests in a run.
///
/// All counters are monotonically increasing; `add` folds another usage in,
/// so per-run usages can be summed across runs (eval suites, optimizer
/// trials) without losing anything.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub requests: u64,
    pub tool_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds another usage into this one.
    pub fn add(&mut self, other: &Usage) {
        self.requests += other.requests;
        self.tool_calls += other.tool_calls;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }

    pub fn inc_requests(&mut self) {
        self.requests += 1;
    }

    pub fn inc_tool_calls(&mut self, n: u64) {
        self.tool_calls += n;
    }

    /// Records token counts for one request; `total_tokens` tracks the sum.
    pub fn add_tokens(&mut self, input: u64, output: u64) {
        self.input_tokens += input;
        self.output_tokens += output;
        self.total_tokens += input + output;
    }
}
