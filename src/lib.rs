//! # agentry
//!
//! A provider-agnostic runtime for building LLM agents in Rust.
//!
//! ## Overview
//!
//! agentry drives OpenAI-compatible and native (Anthropic, Gemini,
//! Mistral) chat APIs through one canonical interface, and layers the
//! machinery an agent needs on top: a run loop that interleaves model
//! requests with tool executions, streaming with provider-chunk
//! normalization, pluggable behaviours (plain request/response or ReAct),
//! structured output with validation retries, an evaluation harness, and
//! a parameter optimizer.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use agentry::{tool, Agent, Model, RunOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let add = tool("add", "Add two numbers")
//!         .param("a", "number")
//!         .param("b", "number")
//!         .build(|_ctx, args| async move {
//!             let a = args["a"].as_f64().unwrap_or(0.0);
//!             let b = args["b"].as_f64().unwrap_or(0.0);
//!             Ok(json!({"result": a + b}))
//!         });
//!
//!     let agent = Agent::builder()
//!         .name("calculator")
//!         .model(Model::parse("openai:gpt-4o-mini")?)
//!         .instructions("You are a precise calculator. Use the add tool.")
//!         .tool(add)
//!         .build()?;
//!
//!     let result = agentry::run(&agent, "What is 2+3?", RunOptions::default()).await?;
//!     println!("{}", result.output_text());
//!     Ok(())
//! }
//! ```
//!
//! ## Streaming
//!
//! ```rust,no_run
//! use agentry::{Agent, Model, RunOptions, StreamEvent};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! # let agent = Agent::builder().model(Model::parse("openai:gpt-4o-mini")?).build()?;
//! let mut events = agentry::run_stream(&agent, "Tell me a story", RunOptions::default()).await?;
//! while let Some(event) = events.next().await {
//!     if let StreamEvent::TextDelta(text) = event? {
//!         print!("{}", text);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Streaming is single-iteration: tool calls appearing in the stream are
//! not executed; follow up with [`run`] to complete the exchange.
//!
//! ## Architecture
//!
//! - **types**: canonical messages, parts, tool calls, usage counters
//! - **model**: `"provider:model"` parsing and per-request settings
//! - **transport**: shared HTTP pool, SSE framing, typed status mapping
//! - **stream**: canonical events and provider-chunk normalizers
//! - **providers**: per-provider request assembly and response parsing
//! - **tools** / **executor**: tool definitions and retrying invocation
//! - **behaviour**: pluggable strategies (Basic, ReAct)
//! - **agent** / **runner** / **context**: configuration and the run loop
//! - **output**: structured-output modes, validation, feedback retries
//! - **telemetry**: span events with attachable subscribers
//! - **eval** / **optimize**: suites, evaluators, and parameter search

mod agent;
mod context;
mod executor;
mod model;
mod output;
mod runner;
mod stream;
mod tools;
mod transport;
mod types;

pub mod behaviour;
pub mod error;
pub mod eval;
pub mod optimize;
pub mod providers;
pub mod retry;
pub mod telemetry;

// --- Core types ---

pub use types::{FinishReason, Message, Part, Role, ToolCall, ToolReturn, Usage};

// --- Model configuration ---

pub use model::{Model, ModelBuilder, ModelSettings, Provider};

// --- Errors ---

pub use error::{Error, FieldError, ProviderErrorKind, Result};

// --- Tools ---

pub use executor::{execute as execute_tool, ToolOutcome};
pub use tools::{sanitize_tool_name, tool, Tool, ToolBuilder, ToolDef, ToolHandler};

// --- Agent & runner ---

pub use agent::{Agent, AgentBuilder, EndStrategy, Instructions, OutputType, UsageLimits};
pub use behaviour::{Behaviour, BehaviourKind};
pub use context::{CancellationToken, Deps, RunContext, RunState};
pub use runner::{
    run, run_stream, run_stream_with_client, run_with_client, RunOptions, RunResult,
};

// --- Streaming ---

pub use stream::{
    normalize_stream, EventStream, MistralNormalizer, NormalizerKind, OpenAiNormalizer,
    StreamEvent, StreamNormalizer, ToolCallAssembler,
};

// --- Providers ---

pub use providers::{ChatModel, ChatResponse};

// --- Structured output ---

pub use output::{ResponseMode, STRUCTURED_OUTPUT_TOOL};

/// The most commonly used items in one import.
pub mod prelude {
    pub use crate::{
        run, run_stream, tool, Agent, BehaviourKind, CancellationToken, EndStrategy, Error,
        Message, Model, ModelSettings, OutputType, Part, Result, Role, RunOptions, RunResult,
        StreamEvent, Tool, ToolCall, Usage, UsageLimits,
    };
}
