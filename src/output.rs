//! Structured output: response-mode selection, extraction, validation.
//!
//! When an agent's output type is a schema, the runner must steer the
//! model into producing conforming JSON and then validate it. Four
//! response modes exist, in descending order of enforcement strength:
//!
//! - `tool_call`: a synthetic `__structured_output__` tool is injected
//!   whose parameter schema is the target; the forced call's arguments are
//!   the output.
//! - `json_schema`: the provider's schema-constrained response format.
//! - `json`: "respond with a JSON object", no schema enforcement.
//! - `md_json`: JSON inside a fenced markdown block; a stop sequence
//!   trims generation after the closing fence.
//!
//! `auto` selection: Anthropic uses `tool_call`, OpenAI-compatible
//! providers use `json_schema`, everything else falls back to `md_json`.
//! Guided-decoding output types (choice / regex / grammar) become request
//! constraints on vLLM and SGLang.
//!
//! Validation failures produce field-level errors; the runner feeds them
//! back to the model as a correction message and re-requests while the
//! agent's output-retry budget lasts.

use crate::agent::{Agent, OutputType};
use crate::context::RunState;
use crate::error::{Error, FieldError, Result};
use crate::model::{ModelSettings, Provider};
use crate::tools::Tool;
use crate::types::Message;
use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

/// Name of the synthetic output tool used by the `tool_call` mode.
pub const STRUCTURED_OUTPUT_TOOL: &str = "__structured_output__";

/// How the model is asked to produce structured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    ToolCall,
    JsonSchema,
    Json,
    MdJson,
}

/// Automatic mode selection per provider.
pub fn auto_mode(provider: Provider) -> ResponseMode {
    if provider == Provider::Anthropic {
        ResponseMode::ToolCall
    } else if provider.is_openai_compatible() {
        ResponseMode::JsonSchema
    } else {
        ResponseMode::MdJson
    }
}

/// The effective mode for an agent with a schema output type.
pub fn response_mode_for(agent: &Agent) -> ResponseMode {
    agent
        .response_mode()
        .unwrap_or_else(|| auto_mode(agent.model().provider))
}

/// Everything the runner merges into a request to obtain structured
/// output.
#[derive(Debug)]
pub struct OutputPlan {
    /// Mode in effect; `None` when the output type needs no steering.
    pub mode: Option<ResponseMode>,
    /// Target schema for validation.
    pub schema: Option<Value>,
    /// Settings layered on top of agent and run settings.
    pub settings: ModelSettings,
    /// Synthetic tool to add to the request (tool_call mode).
    pub synthetic_tool: Option<Tool>,
    /// Extra system-message content (json / md_json modes, choice
    /// fallback).
    pub system_note: Option<String>,
}

impl OutputPlan {
    fn plain() -> Self {
        Self {
            mode: None,
            schema: None,
            settings: ModelSettings::new(),
            synthetic_tool: None,
            system_note: None,
        }
    }
}

/// Builds the output plan for an agent.
///
/// # Errors
///
/// `configuration_error` when a guided-decoding output type (regex or
/// grammar) is requested on a provider without guided decoding.
pub fn prepare(agent: &Agent) -> Result<OutputPlan> {
    let provider = agent.model().provider;
    match agent.output_type() {
        OutputType::Text => Ok(OutputPlan::plain()),

        OutputType::Schema(schema) => {
            let mode = response_mode_for(agent);
            let mut plan = OutputPlan::plain();
            plan.mode = Some(mode);
            plan.schema = Some(schema.clone());

            match mode {
                ResponseMode::ToolCall => {
                    plan.synthetic_tool = Some(Tool::new(
                        STRUCTURED_OUTPUT_TOOL,
                        "Deliver the final structured output.",
                        schema.clone(),
                        |_ctx, args| async move { Ok(args) },
                    ));
                    plan.settings.tool_choice = Some(json!(STRUCTURED_OUTPUT_TOOL));
                }
                ResponseMode::JsonSchema => {
                    plan.settings.response_format = Some(json!({
                        "type": "json_schema",
                        "json_schema": {"name": "output", "schema": schema, "strict": true},
                    }));
                }
                ResponseMode::Json => {
                    plan.settings.response_format = Some(json!({"type": "json_object"}));
                    plan.system_note = Some(
                        "Respond with a single JSON object matching the requested structure, \
                         and nothing else."
                            .to_string(),
                    );
                }
                ResponseMode::MdJson => {
                    plan.system_note = Some(
                        "Respond with a single JSON object inside a fenced ```json code \
                         block. Write nothing after the closing fence."
                            .to_string(),
                    );
                    plan.settings.stop = Some(vec!["\n```\n".to_string()]);
                }
            }
            Ok(plan)
        }

        OutputType::Choice(options) => {
            let mut plan = OutputPlan::plain();
            if provider.supports_guided_decoding() {
                plan.settings
                    .extra
                    .insert("guided_choice".to_string(), json!(options));
            } else {
                // Weak fallback: instruct instead of constrain.
                plan.system_note = Some(format!(
                    "Answer with exactly one of the following, and nothing else: {}",
                    options.join(", ")
                ));
            }
            Ok(plan)
        }

        OutputType::Regex(pattern) => {
            if !provider.supports_guided_decoding() {
                return Err(Error::configuration(format!(
                    "regex-guided output requires vllm or sglang, not {}",
                    provider
                )));
            }
            let mut plan = OutputPlan::plain();
            plan.settings
                .extra
                .insert("guided_regex".to_string(), json!(pattern));
            Ok(plan)
        }

        OutputType::Grammar(grammar) => {
            if !provider.supports_guided_decoding() {
                return Err(Error::configuration(format!(
                    "grammar-guided output requires vllm or sglang, not {}",
                    provider
                )));
            }
            let mut plan = OutputPlan::plain();
            plan.settings
                .extra
                .insert("guided_grammar".to_string(), json!(grammar));
            Ok(plan)
        }
    }
}

static FENCED_JSON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*(?:```|$)").expect("fenced-json regex compiles")
});

/// Pulls the JSON candidate out of model text: direct parse first, then
/// the first fenced block, then the outermost brace span.
pub fn parse_json_text(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    if let Some(captures) = FENCED_JSON.captures(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(&captures[1]) {
            return Some(value);
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    serde_json::from_str(&trimmed[start..=end]).ok()
}

/// Extracts the structured-output candidate from the run state, according
/// to the agent's effective response mode.
pub fn extract_candidate(agent: &Agent, state: &RunState) -> Option<Value> {
    match response_mode_for(agent) {
        ResponseMode::ToolCall => state.messages.iter().rev().find_map(|message| {
            message.tool_calls().into_iter().find_map(|call| {
                if call.name != STRUCTURED_OUTPUT_TOOL {
                    return None;
                }
                match &call.arguments {
                    Value::String(raw) => serde_json::from_str(raw).ok(),
                    other => Some(other.clone()),
                }
            })
        }),
        _ => state
            .last_assistant()
            .and_then(|message| parse_json_text(&message.text())),
    }
}

/// Validates a value against a JSON schema, returning field-level errors.
pub fn validate(schema: &Value, value: &Value) -> Result<Vec<FieldError>> {
    let compiled = JSONSchema::compile(schema)
        .map_err(|err| Error::configuration(format!("invalid output schema: {}", err)))?;
    let result: Result<Vec<FieldError>> = match compiled.validate(value) {
        Ok(()) => Ok(Vec::new()),
        Err(errors) => Ok(errors
            .map(|err| FieldError {
                path: err.instance_path.to_string(),
                message: err.to_string(),
            })
            .collect()),
    };
    result
}

/// Builds the correction message sent back to the model after a
/// validation failure.
pub fn feedback_message(errors: &[FieldError]) -> Message {
    let mut text = String::from(
        "The previous response did not match the required schema. Fix these errors and \
         respond again with a corrected JSON object:\n",
    );
    for error in errors {
        text.push_str("- ");
        text.push_str(&error.to_string());
        text.push('\n');
    }
    Message::user(text)
}
