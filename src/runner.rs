//! The agent run loop.
//!
//! One run interleaves model requests and tool executions until the
//! behaviour reports completion, a bound is hit, or the caller cancels.
//! Per iteration: check cancellation, check the iteration bound, let the
//! behaviour build the request, dispatch it (with retries for retryable
//! provider failures only), account usage against limits, let the
//! behaviour process the response, and execute any tool calls in emission
//! order before looping. Tool results are appended in the same order as
//! their calls, so the next request sees them exactly as emitted.
//!
//! The streaming variant performs a single iteration and returns the
//! canonical event stream; it never executes tools. If tool calls appear
//! in the stream, follow up with [`run`] to complete the exchange.

use crate::agent::{Agent, EndStrategy, UsageLimits};
use crate::behaviour::Behaviour;
use crate::context::{CancellationToken, Deps, RunContext, RunState};
use crate::error::{Error, Result};
use crate::executor;
use crate::model::ModelSettings;
use crate::output::{self, OutputPlan, ResponseMode, STRUCTURED_OUTPUT_TOOL};
use crate::providers::{self, ChatModel, ChatResponse};
use crate::retry::{retry_with_backoff_conditional, RetryConfig};
use crate::stream::EventStream;
use crate::telemetry::{self, Span, AGENT_RUN, MODEL_REQUEST};
use crate::tools::{Tool, ToolDef};
use crate::types::{Message, ToolCall, Usage};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Options for one run.
#[derive(Clone)]
pub struct RunOptions {
    /// Opaque dependencies handed to every tool call.
    pub deps: Deps,
    /// Prior conversation to continue from.
    pub message_history: Vec<Message>,
    /// Per-run caps; override the agent's own when set.
    pub usage_limits: Option<UsageLimits>,
    /// Settings layered over the agent defaults for this run.
    pub model_settings: Option<ModelSettings>,
    /// Model-request bound for the loop.
    pub max_iterations: u32,
    pub cancellation: CancellationToken,
    /// Tools marked `requires_approval` that this run may execute.
    pub approved_tools: HashSet<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            deps: Deps::new(),
            message_history: Vec::new(),
            usage_limits: None,
            model_settings: None,
            max_iterations: 10,
            cancellation: CancellationToken::new(),
            approved_tools: HashSet::new(),
        }
    }
}

/// What a completed run returns.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// The extracted output: a string for text agents, a validated JSON
    /// value for structured ones.
    pub output: Value,
    /// Usage accumulated across every model request of the run.
    pub usage: Usage,
    /// The full transcript, supplied history included.
    pub all_messages: Vec<Message>,
    /// Only the messages produced by this run.
    pub new_messages: Vec<Message>,
    /// Final dependency map (context patches applied).
    pub deps: Deps,
}

impl RunResult {
    /// The output as text (structured outputs are serialized).
    pub fn output_text(&self) -> String {
        match &self.output {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Runs an agent against the provider configured on its model.
pub async fn run(agent: &Agent, prompt: &str, options: RunOptions) -> Result<RunResult> {
    let client = providers::dispatch(agent.model().provider);
    run_with_client(agent, prompt, options, client).await
}

/// Runs an agent against an explicit [`ChatModel`] (test doubles, custom
/// transports).
pub async fn run_with_client(
    agent: &Agent,
    prompt: &str,
    options: RunOptions,
    client: Arc<dyn ChatModel>,
) -> Result<RunResult> {
    let span = Span::start(AGENT_RUN, run_metadata(agent));
    let outcome = run_inner(agent, prompt, options, client).await;
    match &outcome {
        Ok((result, iterations)) => {
            let mut measurements = Map::new();
            measurements.insert("tokens".to_string(), Value::from(result.usage.total_tokens));
            measurements.insert("tool_calls".to_string(), Value::from(result.usage.tool_calls));
            measurements.insert("requests".to_string(), Value::from(result.usage.requests));
            measurements.insert("iterations".to_string(), Value::from(*iterations));
            span.stop(measurements);
        }
        Err(err) => span.exception(err.code()),
    }
    outcome.map(|(result, _)| result)
}

/// Opens a streaming run: one model request, canonical events straight
/// through. Tool-call loops are not driven here.
pub async fn run_stream(agent: &Agent, prompt: &str, options: RunOptions) -> Result<EventStream> {
    let client = providers::dispatch(agent.model().provider);
    run_stream_with_client(agent, prompt, options, client).await
}

/// Streaming variant of [`run_with_client`].
pub async fn run_stream_with_client(
    agent: &Agent,
    prompt: &str,
    options: RunOptions,
    client: Arc<dyn ChatModel>,
) -> Result<EventStream> {
    if options.cancellation.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let behaviour = agent.behaviour().instance();
    let ctx = RunContext::new(
        options.deps,
        options.cancellation.clone(),
        options.approved_tools,
    );
    let mut state = RunState::new(options.message_history, ctx);
    state.messages.push(Message::user(prompt));
    behaviour.init_context(agent, &mut state);

    let plan = output::prepare(agent)?;
    let (_tools, tool_defs) = assemble_tools(agent, behaviour, &plan);

    let messages = build_request_messages(agent, behaviour, &state, &plan);
    let settings = effective_settings(agent, &options.model_settings, &plan);

    client
        .request_stream(agent.model(), &messages, &tool_defs, &settings)
        .await
}

fn run_metadata(agent: &Agent) -> Map<String, Value> {
    telemetry::meta(&[
        ("agent_name", agent.name()),
        ("provider", agent.model().provider.as_str()),
        ("model_name", &agent.model().name),
    ])
}

fn assemble_tools(
    agent: &Agent,
    behaviour: &dyn Behaviour,
    plan: &OutputPlan,
) -> (Vec<Arc<Tool>>, Vec<ToolDef>) {
    let mut tools = behaviour.get_tools(agent);
    if let Some(synthetic) = &plan.synthetic_tool {
        tools.push(Arc::new(synthetic.clone()));
    }
    let defs = tools.iter().map(|t| t.def()).collect();
    (tools, defs)
}

fn build_request_messages(
    agent: &Agent,
    behaviour: &dyn Behaviour,
    state: &RunState,
    plan: &OutputPlan,
) -> Vec<Message> {
    let mut messages = behaviour.build_messages(agent, state);
    if let Some(note) = &plan.system_note {
        match messages.first_mut() {
            Some(first) if matches!(first.role, crate::types::Role::System) => {
                let mut text = first.text();
                text.push_str("\n\n");
                text.push_str(note);
                *first = Message::system(text);
            }
            _ => messages.insert(0, Message::system(note.clone())),
        }
    }
    messages
}

fn effective_settings(
    agent: &Agent,
    run_settings: &Option<ModelSettings>,
    plan: &OutputPlan,
) -> ModelSettings {
    let mut settings = agent.model().settings.merged(agent.settings());
    if let Some(run_settings) = run_settings {
        settings = settings.merged(run_settings);
    }
    settings.merged(&plan.settings)
}

fn check_limits(limits: &Option<UsageLimits>, usage: &Usage) -> Result<()> {
    if let Some(limits) = limits {
        if let Some(exceeded) = limits.check(usage) {
            return Err(Error::usage_limit(exceeded));
        }
    }
    Ok(())
}

async fn run_inner(
    agent: &Agent,
    prompt: &str,
    options: RunOptions,
    client: Arc<dyn ChatModel>,
) -> Result<(RunResult, u32)> {
    let behaviour = agent.behaviour().instance();
    let ctx = RunContext::new(
        options.deps,
        options.cancellation.clone(),
        options.approved_tools,
    );
    let mut state = RunState::new(options.message_history, ctx);
    state.messages.push(Message::user(prompt));
    behaviour.init_context(agent, &mut state);

    let plan = output::prepare(agent)?;
    let (tools, tool_defs) = assemble_tools(agent, behaviour, &plan);

    let limits = options.usage_limits.or_else(|| agent.usage_limits().copied());
    let request_retry = RetryConfig::default()
        .with_max_attempts(agent.retries() + 1)
        .with_initial_delay(std::time::Duration::from_millis(500));

    let mut validation_attempts: u32 = 0;

    loop {
        if state.ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if state.iterations >= options.max_iterations {
            return Err(Error::MaxIterationsExceeded(options.max_iterations));
        }

        let messages = build_request_messages(agent, behaviour, &state, &plan);
        let settings = effective_settings(agent, &options.model_settings, &plan);

        let request_span = Span::start(MODEL_REQUEST, run_metadata(agent));
        let response: ChatResponse = match retry_with_backoff_conditional(request_retry.clone(), || {
            client.request(agent.model(), &messages, &tool_defs, &settings)
        })
        .await
        {
            Ok(response) => {
                let mut measurements = Map::new();
                measurements.insert(
                    "tokens".to_string(),
                    Value::from(response.usage.total_tokens),
                );
                request_span.stop(measurements);
                response
            }
            Err(err) => {
                request_span.exception(err.code());
                return Err(err);
            }
        };
        state.iterations += 1;

        state.ctx.record_usage(&response.usage);
        check_limits(&limits, &state.ctx.usage())?;

        behaviour.process_response(agent, &response, &mut state);

        // The synthetic output call is the output itself, never a tool to
        // execute.
        if plan.mode == Some(ResponseMode::ToolCall)
            && response
                .message
                .tool_calls()
                .iter()
                .any(|c| c.name == STRUCTURED_OUTPUT_TOOL)
        {
            state.needs_response = false;
        }

        if state.needs_response {
            let calls: Vec<ToolCall> = response
                .message
                .tool_calls()
                .into_iter()
                .cloned()
                .collect();
            execute_calls(agent, behaviour, &tools, &calls, &mut state).await;
            check_limits(&limits, &state.ctx.usage())?;
            continue;
        }

        // Terminal response. Under the exhaustive end strategy, pending
        // tool calls still run; their results are recorded without
        // another request.
        if agent.end_strategy() == EndStrategy::Exhaustive {
            let pending: Vec<ToolCall> = response
                .message
                .tool_calls()
                .into_iter()
                .filter(|c| c.name != STRUCTURED_OUTPUT_TOOL)
                .cloned()
                .collect();
            if !pending.is_empty() {
                execute_calls(agent, behaviour, &tools, &pending, &mut state).await;
                check_limits(&limits, &state.ctx.usage())?;
            }
        }

        // Structured output: validate, and feed errors back while the
        // retry budget lasts.
        if let Some(schema) = &plan.schema {
            match behaviour.extract_output(agent, &state) {
                Some(candidate) => {
                    let errors = output::validate(schema, &candidate)?;
                    if errors.is_empty() {
                        return Ok(finish(candidate, state));
                    }
                    if validation_attempts < agent.output_retries() {
                        validation_attempts += 1;
                        log::debug!(
                            "structured output failed validation ({} error(s)), retrying",
                            errors.len()
                        );
                        answer_dangling_output_call(&plan, &mut state);
                        state.messages.push(output::feedback_message(&errors));
                        state.needs_response = true;
                        continue;
                    }
                    return Err(Error::validation(
                        "structured output failed validation",
                        errors,
                    ));
                }
                None => {
                    if validation_attempts < agent.output_retries() {
                        validation_attempts += 1;
                        state.messages.push(Message::user(
                            "Respond with a single JSON object matching the required schema.",
                        ));
                        state.needs_response = true;
                        continue;
                    }
                    return Err(Error::validation("no structured output produced", Vec::new()));
                }
            }
        }

        let output = behaviour
            .extract_output(agent, &state)
            .ok_or_else(|| Error::validation("agent produced no output", Vec::new()))?;
        return Ok(finish(output, state));
    }
}

/// In tool_call mode the synthetic output call is intercepted, not
/// executed, so a validation retry must still answer it; providers reject
/// transcripts with unanswered tool calls.
fn answer_dangling_output_call(plan: &OutputPlan, state: &mut RunState) {
    if plan.mode != Some(ResponseMode::ToolCall) {
        return;
    }
    let Some(call_id) = state.last_assistant().and_then(|message| {
        message
            .tool_calls()
            .into_iter()
            .find(|c| c.name == STRUCTURED_OUTPUT_TOOL)
            .map(|c| c.id.clone())
    }) else {
        return;
    };
    state.messages.push(Message::tool_result(
        call_id,
        serde_json::json!({"error": "output failed schema validation"}),
    ));
}

/// Executes tool calls in emission order, appending each result message
/// immediately so the pairing and ordering invariants hold.
async fn execute_calls(
    agent: &Agent,
    behaviour: &dyn Behaviour,
    tools: &[Arc<Tool>],
    calls: &[ToolCall],
    state: &mut RunState,
) {
    for call in calls {
        let outcome = executor::execute(tools, call, &state.ctx, agent.tool_timeout()).await;
        state.ctx.record_tool_calls(1);
        state
            .messages
            .push(Message::tool_result(&outcome.call_id, outcome.result.clone()));
        behaviour.after_tool(agent, call, &outcome.result, state);
        if let Some(patch) = outcome.context_patch {
            state.ctx.merge_deps(patch);
        }
    }
}

fn finish(output: Value, state: RunState) -> (RunResult, u32) {
    let iterations = state.iterations;
    let usage = state.ctx.usage();
    let deps = state.ctx.deps();
    let new_messages = state.new_messages().to_vec();
    (
        RunResult {
            output,
            usage,
            all_messages: state.messages,
            new_messages,
            deps,
        },
        iterations,
    )
}
