//! Agent configuration.
//!
//! An [`Agent`] is the immutable bundle the runner executes: a model, the
//! instructions, the tools, default settings, and the policies that bound
//! a run (retries, end strategy, output type, usage limits). Construct one
//! through the validating builder:
//!
//! ```
//! use agentry::{Agent, Model};
//!
//! let agent = Agent::builder()
//!     .name("assistant")
//!     .model(Model::parse("openai:gpt-4o-mini").unwrap())
//!     .instructions("You are a helpful assistant.")
//!     .build()
//!     .unwrap();
//! assert_eq!(agent.name(), "assistant");
//! ```

use crate::behaviour::BehaviourKind;
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::model::{Model, ModelSettings};
use crate::tools::Tool;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Agent instructions: fixed text, or computed per run from the context.
#[derive(Clone)]
pub enum Instructions {
    Static(String),
    /// Receives the run context (deps included) before the first request.
    Dynamic(Arc<dyn Fn(&RunContext) -> String + Send + Sync>),
}

impl Instructions {
    pub fn resolve(&self, ctx: &RunContext) -> String {
        match self {
            Instructions::Static(text) => text.clone(),
            Instructions::Dynamic(f) => f(ctx),
        }
    }
}

impl std::fmt::Debug for Instructions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instructions::Static(text) => f.debug_tuple("Static").field(text).finish(),
            Instructions::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl From<String> for Instructions {
    fn from(text: String) -> Self {
        Instructions::Static(text)
    }
}

impl From<&str> for Instructions {
    fn from(text: &str) -> Self {
        Instructions::Static(text.to_string())
    }
}

/// When the run loop stops relative to pending tool calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EndStrategy {
    /// Stop as soon as the behaviour reports no further response is
    /// needed; tool calls arriving alongside a terminal signal are skipped.
    #[default]
    Early,
    /// Execute every pending tool call of the final assistant message
    /// before finishing (their results are recorded but trigger no new
    /// request).
    Exhaustive,
}

/// What the run should produce.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum OutputType {
    /// The assistant's text.
    #[default]
    Text,
    /// JSON validated against this schema (see the structured-output
    /// response modes).
    Schema(Value),
    /// Guided decoding: exactly one of these strings (vLLM/SGLang).
    Choice(Vec<String>),
    /// Guided decoding: text matching this regex (vLLM/SGLang).
    Regex(String),
    /// Guided decoding: text derivable from this EBNF grammar
    /// (vLLM/SGLang).
    Grammar(String),
}

/// Per-run caps, enforced centrally by the runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageLimits {
    pub max_requests: Option<u64>,
    pub max_tool_calls: Option<u64>,
    pub max_total_tokens: Option<u64>,
}

impl UsageLimits {
    /// Returns a description of the first exceeded limit, if any.
    pub fn check(&self, usage: &crate::types::Usage) -> Option<String> {
        if let Some(max) = self.max_total_tokens {
            if usage.total_tokens > max {
                return Some(format!("total_tokens {} > {}", usage.total_tokens, max));
            }
        }
        if let Some(max) = self.max_requests {
            if usage.requests > max {
                return Some(format!("requests {} > {}", usage.requests, max));
            }
        }
        if let Some(max) = self.max_tool_calls {
            if usage.tool_calls > max {
                return Some(format!("tool_calls {} > {}", usage.tool_calls, max));
            }
        }
        None
    }
}

/// Immutable agent configuration. See the module docs for construction.
#[derive(Clone)]
pub struct Agent {
    name: String,
    model: Model,
    instructions: Option<Instructions>,
    tools: Vec<Arc<Tool>>,
    settings: ModelSettings,
    retries: u32,
    end_strategy: EndStrategy,
    behaviour: BehaviourKind,
    output_type: OutputType,
    output_retries: u32,
    response_mode: Option<crate::output::ResponseMode>,
    usage_limits: Option<UsageLimits>,
    tool_timeout: Duration,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Resolves the instructions for this run, if any were configured.
    pub fn instructions_text(&self, ctx: &RunContext) -> Option<String> {
        self.instructions
            .as_ref()
            .map(|i| i.resolve(ctx))
            .filter(|text| !text.is_empty())
    }

    pub fn tools(&self) -> &[Arc<Tool>] {
        &self.tools
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    /// Model-request retry attempts (applied to retryable failures only).
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn end_strategy(&self) -> EndStrategy {
        self.end_strategy
    }

    pub fn behaviour(&self) -> BehaviourKind {
        self.behaviour
    }

    pub fn output_type(&self) -> &OutputType {
        &self.output_type
    }

    /// Structured-output validation retries (re-request with feedback).
    pub fn output_retries(&self) -> u32 {
        self.output_retries
    }

    /// Explicit structured-output response mode; `None` selects per
    /// provider automatically.
    pub fn response_mode(&self) -> Option<crate::output::ResponseMode> {
        self.response_mode
    }

    pub fn usage_limits(&self) -> Option<&UsageLimits> {
        self.usage_limits.as_ref()
    }

    /// Default per-tool timeout when a tool specifies none.
    pub fn tool_timeout(&self) -> Duration {
        self.tool_timeout
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("tools", &format!("{} tools", self.tools.len()))
            .field("behaviour", &self.behaviour)
            .field("end_strategy", &self.end_strategy)
            .finish()
    }
}

/// Builder for [`Agent`] with validation at `build()`.
#[derive(Default)]
pub struct AgentBuilder {
    name: Option<String>,
    model: Option<Model>,
    instructions: Option<Instructions>,
    tools: Vec<Arc<Tool>>,
    settings: ModelSettings,
    retries: Option<u32>,
    end_strategy: EndStrategy,
    behaviour: BehaviourKind,
    output_type: OutputType,
    output_retries: Option<u32>,
    response_mode: Option<crate::output::ResponseMode>,
    usage_limits: Option<UsageLimits>,
    tool_timeout: Option<Duration>,
}

impl AgentBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The model configuration (required).
    pub fn model(mut self, model: Model) -> Self {
        self.model = Some(model);
        self
    }

    /// Static instructions text.
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(Instructions::Static(instructions.into()));
        self
    }

    /// Instructions computed from the run context before the first request.
    pub fn dynamic_instructions<F>(mut self, f: F) -> Self
    where
        F: Fn(&RunContext) -> String + Send + Sync + 'static,
    {
        self.instructions = Some(Instructions::Dynamic(Arc::new(f)));
        self
    }

    pub fn tool(mut self, tool: Tool) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools.extend(tools.into_iter().map(Arc::new));
        self
    }

    /// Adds already-shared tools without re-wrapping them.
    pub fn shared_tools(mut self, tools: impl IntoIterator<Item = Arc<Tool>>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Default model settings merged under run-level overrides.
    pub fn settings(mut self, settings: ModelSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Model-request retry attempts for retryable failures.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn end_strategy(mut self, strategy: EndStrategy) -> Self {
        self.end_strategy = strategy;
        self
    }

    pub fn behaviour(mut self, behaviour: BehaviourKind) -> Self {
        self.behaviour = behaviour;
        self
    }

    pub fn output_type(mut self, output_type: OutputType) -> Self {
        self.output_type = output_type;
        self
    }

    /// Structured-output validation retries (default 1).
    pub fn output_retries(mut self, retries: u32) -> Self {
        self.output_retries = Some(retries);
        self
    }

    /// Forces a structured-output response mode instead of the automatic
    /// per-provider selection.
    pub fn response_mode(mut self, mode: crate::output::ResponseMode) -> Self {
        self.response_mode = Some(mode);
        self
    }

    pub fn usage_limits(mut self, limits: UsageLimits) -> Self {
        self.usage_limits = Some(limits);
        self
    }

    /// Default timeout applied to tools that set none.
    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = Some(timeout);
        self
    }

    /// Validates and builds the agent.
    ///
    /// # Errors
    ///
    /// `configuration_error` when the model is missing, tool names
    /// collide, or user tools clash with the selected behaviour's
    /// synthetic tools.
    pub fn build(self) -> Result<Agent> {
        let model = self
            .model
            .ok_or_else(|| Error::configuration("model is required"))?;

        let mut seen = HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.name().to_string()) {
                return Err(Error::configuration(format!(
                    "duplicate tool name '{}'",
                    tool.name()
                )));
            }
        }

        // The behaviour selector must be consistent with the tool set:
        // ReAct's synthetic names are reserved for it, and a Basic agent
        // carrying them is a configuration mistake, not a quiet override.
        let synthetic = crate::behaviour::react::SYNTHETIC_TOOL_NAMES;
        for tool in &self.tools {
            if synthetic.contains(&tool.name()) {
                return Err(Error::configuration(format!(
                    "tool name '{}' is reserved by the ReAct behaviour",
                    tool.name()
                )));
            }
        }

        Ok(Agent {
            name: self.name.unwrap_or_else(|| "agent".to_string()),
            model,
            instructions: self.instructions,
            tools: self.tools,
            settings: self.settings,
            retries: self.retries.unwrap_or(1),
            end_strategy: self.end_strategy,
            behaviour: self.behaviour,
            output_type: self.output_type,
            output_retries: self.output_retries.unwrap_or(1),
            response_mode: self.response_mode,
            usage_limits: self.usage_limits,
            tool_timeout: self.tool_timeout.unwrap_or(Duration::from_secs(30)),
        })
    }
}
