//! Reasoning-and-Acting strategy.
//!
//! ReAct forces an explicit workflow on the model: write a plan, track the
//! work as todos, act and observe through the agent's tools, and deliver
//! the result through `final_answer`. The workflow is enforced with six
//! synthetic tools whose only side effects are writes into behaviour
//! private state; `final_answer` is the terminal signal.
//!
//! The phase machine is `planning -> acting -> done`: the first `plan`
//! call moves to acting, `final_answer` moves to done, and done is
//! terminal. Byte-identical repeated tool calls are warned about (loop
//! detection) but never suppressed; the model stays in charge.

use super::Behaviour;
use crate::agent::{Agent, OutputType};
use crate::context::RunState;
use crate::error::Error;
use crate::providers::ChatResponse;
use crate::tools::{tool, Tool};
use crate::types::{Message, Role, ToolCall};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Tool names injected by ReAct; reserved, user tools cannot shadow them.
pub const SYNTHETIC_TOOL_NAMES: &[&str] = &[
    "plan",
    "add_todo",
    "complete_todo",
    "list_todos",
    "note",
    "final_answer",
];

const WORKFLOW_PROMPT: &str = "\
Follow this workflow strictly:
1. Call `plan` first: state the question, what you already know, what you \
must look up, and the actions you intend to take.
2. Track your work: `add_todo` for each step, `complete_todo` when a step \
is finished, `list_todos` to review what is left.
3. Act and observe: use the available tools, and record observations with \
`note`.
4. When the task is complete, call `final_answer` with your full answer. \
Only `final_answer` ends the task; never stop without calling it.";

/// Where a ReAct run currently is in its workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReactPhase {
    #[default]
    Planning,
    Acting,
    Done,
}

/// One tracked todo item.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TodoItem {
    pub id: u64,
    pub item: String,
    pub priority: String,
    pub done: bool,
}

/// Behaviour-private state for one ReAct run.
#[derive(Debug, Default)]
pub struct ReactState {
    pub phase: ReactPhase,
    pub plans: Vec<Value>,
    pub todos: Vec<TodoItem>,
    pub notes: Vec<String>,
    /// `(name, canonical argument JSON)` of every executed tool call.
    pub tool_history: Vec<(String, String)>,
    pub final_answer: Option<String>,
    next_todo_id: u64,
}

impl ReactState {
    fn next_id(&mut self) -> u64 {
        self.next_todo_id += 1;
        self.next_todo_id
    }
}

pub struct ReactBehaviour;

fn lock_error() -> Error {
    Error::tool("behaviour state lock poisoned")
}

fn synthetic_tools() -> Vec<Arc<Tool>> {
    let plan = tool(
        "plan",
        "Record your plan before acting: the question, known facts, facts to look up, and intended actions.",
    )
    .param("question", "string")
    .optional_param("known_facts", "array")
    .optional_param("facts_to_lookup", "array")
    .optional_param("actions", "array")
    .build(|ctx, args| async move {
        let mut state = ctx.react.lock().map_err(|_| lock_error())?;
        state.plans.push(args);
        if state.phase == ReactPhase::Planning {
            state.phase = ReactPhase::Acting;
        }
        Ok(json!({"status": "plan recorded"}))
    });

    let add_todo = tool("add_todo", "Add an item to your todo list.")
        .param("item", "string")
        .optional_param("priority", "string")
        .build(|ctx, args| async move {
            let mut state = ctx.react.lock().map_err(|_| lock_error())?;
            let id = state.next_id();
            let item = TodoItem {
                id,
                item: args
                    .get("item")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                priority: args
                    .get("priority")
                    .and_then(Value::as_str)
                    .unwrap_or("normal")
                    .to_string(),
                done: false,
            };
            state.todos.push(item.clone());
            Ok(json!({"status": "added", "todo": item}))
        });

    let complete_todo = tool(
        "complete_todo",
        "Mark a todo as done, by its id or its exact text.",
    )
    .optional_param("id", "integer")
    .optional_param("item", "string")
    .build(|ctx, args| async move {
        let mut state = ctx.react.lock().map_err(|_| lock_error())?;
        let id = args.get("id").and_then(Value::as_u64);
        let text = args.get("item").and_then(Value::as_str);
        let found = state.todos.iter_mut().find(|t| {
            id.map(|id| t.id == id).unwrap_or(false)
                || text.map(|text| t.item == text).unwrap_or(false)
        });
        match found {
            Some(todo) => {
                todo.done = true;
                Ok(json!({"status": "completed", "todo": todo.clone()}))
            }
            None => Ok(json!({"error": "no matching todo"})),
        }
    });

    let list_todos = tool("list_todos", "List all todos and their status.").build(
        |ctx, _args| async move {
            let state = ctx.react.lock().map_err(|_| lock_error())?;
            Ok(json!({"todos": state.todos}))
        },
    );

    let note = tool("note", "Record an observation worth remembering.")
        .param("content", "string")
        .build(|ctx, args| async move {
            let mut state = ctx.react.lock().map_err(|_| lock_error())?;
            state.notes.push(
                args.get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            );
            Ok(json!({"status": "noted"}))
        });

    let final_answer = tool(
        "final_answer",
        "Deliver your complete final answer. This ends the task.",
    )
    .param("answer", "string")
    .build(|ctx, args| async move {
        let mut state = ctx.react.lock().map_err(|_| lock_error())?;
        let answer = args
            .get("answer")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        state.final_answer = Some(answer);
        state.phase = ReactPhase::Done;
        Ok(json!({"status": "final answer recorded"}))
    });

    vec![
        Arc::new(plan),
        Arc::new(add_todo),
        Arc::new(complete_todo),
        Arc::new(list_todos),
        Arc::new(note),
        Arc::new(final_answer),
    ]
}

/// Canonical rendering of a call for the duplicate-detection history.
fn call_fingerprint(call: &ToolCall) -> (String, String) {
    (call.name.clone(), call.arguments.to_string())
}

impl Behaviour for ReactBehaviour {
    fn init_context(&self, _agent: &Agent, state: &mut RunState) {
        if let Ok(mut react) = state.ctx.react.lock() {
            *react = ReactState::default();
        }
    }

    fn build_messages(&self, agent: &Agent, state: &RunState) -> Vec<Message> {
        let mut messages = Vec::with_capacity(state.messages.len() + 1);
        let has_system = state.messages.iter().any(|m| matches!(m.role, Role::System));
        if !has_system {
            let mut system = agent.instructions_text(&state.ctx).unwrap_or_default();
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            system.push_str(WORKFLOW_PROMPT);
            messages.push(Message::system(system));
        }
        messages.extend(state.messages.iter().cloned());
        messages
    }

    fn process_response(&self, _agent: &Agent, response: &ChatResponse, state: &mut RunState) {
        let calls = response.message.tool_calls();

        // Capture the answer here rather than relying on the tool handler,
        // so an `early` end strategy that skips execution still has it.
        let final_call = calls.iter().find(|c| c.name == "final_answer");
        if let Some(call) = final_call {
            if let Ok(mut react) = state.ctx.react.lock() {
                react.final_answer = call
                    .arguments
                    .get("answer")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or(react.final_answer.take());
                react.phase = ReactPhase::Done;
            }
        }

        state.needs_response = !calls.is_empty() && final_call.is_none();
        state.messages.push(response.message.clone());
    }

    fn extract_output(&self, agent: &Agent, state: &RunState) -> Option<Value> {
        let answer = state
            .ctx
            .react
            .lock()
            .ok()
            .and_then(|react| react.final_answer.clone());

        match (answer, agent.output_type()) {
            (Some(answer), OutputType::Schema(_)) => {
                // A structured agent's final answer should itself be the
                // JSON payload.
                serde_json::from_str(&answer)
                    .ok()
                    .or_else(|| crate::output::extract_candidate(agent, state))
            }
            (Some(answer), _) => Some(Value::String(answer)),
            (None, OutputType::Schema(_)) => crate::output::extract_candidate(agent, state),
            (None, _) => state
                .last_assistant()
                .map(|message| Value::String(message.text())),
        }
    }

    fn get_tools(&self, agent: &Agent) -> Vec<Arc<Tool>> {
        let mut tools = agent.tools().to_vec();
        tools.extend(synthetic_tools());
        tools
    }

    fn after_tool(&self, _agent: &Agent, call: &ToolCall, _result: &Value, state: &mut RunState) {
        let fingerprint = call_fingerprint(call);
        if let Ok(mut react) = state.ctx.react.lock() {
            if react.tool_history.contains(&fingerprint) {
                log::warn!(
                    "possible tool loop: '{}' called again with identical arguments {}",
                    fingerprint.0,
                    fingerprint.1
                );
            }
            react.tool_history.push(fingerprint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behaviour::BehaviourKind;
    use crate::context::{RunContext, RunState};
    use crate::model::Model;
    use crate::types::{FinishReason, Part, Usage};

    fn agent() -> Agent {
        Agent::builder()
            .model(
                Model::builder("openai:gpt-4o-mini")
                    .unwrap()
                    .api_key("sk-test")
                    .build()
                    .unwrap(),
            )
            .behaviour(BehaviourKind::React)
            .instructions("Research questions thoroughly.")
            .build()
            .unwrap()
    }

    fn fresh_state() -> RunState {
        RunState::new(vec![Message::user("why is the sky blue?")], RunContext::default())
    }

    fn response_with_calls(calls: Vec<ToolCall>) -> ChatResponse {
        ChatResponse {
            message: Message::assistant(calls.into_iter().map(Part::ToolCall).collect()),
            usage: Usage::new(),
            finish: FinishReason::ToolCalls,
        }
    }

    #[test]
    fn test_system_prompt_carries_workflow() {
        let agent = agent();
        let state = fresh_state();
        let messages = ReactBehaviour.build_messages(&agent, &state);
        let system = messages[0].text();
        assert!(system.contains("Research questions thoroughly."));
        assert!(system.contains("final_answer"));
        assert!(system.contains("plan"));
    }

    #[test]
    fn test_synthetic_tools_injected() {
        let agent = agent();
        let tools = ReactBehaviour.get_tools(&agent);
        for name in SYNTHETIC_TOOL_NAMES {
            assert!(tools.iter().any(|t| t.name() == *name), "missing {}", name);
        }
    }

    #[tokio::test]
    async fn test_phase_machine_plan_then_final_answer() {
        let state = fresh_state();
        let ctx = state.ctx.clone();
        let tools = synthetic_tools();

        assert_eq!(ctx.react.lock().unwrap().phase, ReactPhase::Planning);

        let plan = tools.iter().find(|t| t.name() == "plan").unwrap();
        plan.invoke(ctx.clone(), json!({"question": "why?"}))
            .await
            .unwrap();
        assert_eq!(ctx.react.lock().unwrap().phase, ReactPhase::Acting);

        let final_answer = tools.iter().find(|t| t.name() == "final_answer").unwrap();
        final_answer
            .invoke(ctx.clone(), json!({"answer": "Rayleigh scattering."}))
            .await
            .unwrap();
        let react = ctx.react.lock().unwrap();
        assert_eq!(react.phase, ReactPhase::Done);
        assert_eq!(react.final_answer.as_deref(), Some("Rayleigh scattering."));
    }

    #[tokio::test]
    async fn test_todo_lifecycle() {
        let state = fresh_state();
        let ctx = state.ctx.clone();
        let tools = synthetic_tools();
        let add = tools.iter().find(|t| t.name() == "add_todo").unwrap();
        let complete = tools.iter().find(|t| t.name() == "complete_todo").unwrap();
        let list = tools.iter().find(|t| t.name() == "list_todos").unwrap();

        let added = add
            .invoke(ctx.clone(), json!({"item": "check spectra", "priority": "high"}))
            .await
            .unwrap();
        assert_eq!(added["todo"]["id"], 1);

        add.invoke(ctx.clone(), json!({"item": "write summary"}))
            .await
            .unwrap();

        let by_id = complete
            .invoke(ctx.clone(), json!({"id": 1}))
            .await
            .unwrap();
        assert_eq!(by_id["status"], "completed");

        let by_text = complete
            .invoke(ctx.clone(), json!({"item": "write summary"}))
            .await
            .unwrap();
        assert_eq!(by_text["status"], "completed");

        let listed = list.invoke(ctx.clone(), json!({})).await.unwrap();
        let todos = listed["todos"].as_array().unwrap();
        assert_eq!(todos.len(), 2);
        assert!(todos.iter().all(|t| t["done"] == true));

        let missing = complete.invoke(ctx, json!({"id": 99})).await.unwrap();
        assert_eq!(missing["error"], "no matching todo");
    }

    #[test]
    fn test_final_answer_ends_the_loop() {
        let agent = agent();
        let mut state = fresh_state();

        let searching = response_with_calls(vec![ToolCall::new(
            "call_1",
            "note",
            json!({"content": "found it"}),
        )]);
        ReactBehaviour.process_response(&agent, &searching, &mut state);
        assert!(state.needs_response);

        let finishing = response_with_calls(vec![ToolCall::new(
            "call_2",
            "final_answer",
            json!({"answer": "scattering"}),
        )]);
        ReactBehaviour.process_response(&agent, &finishing, &mut state);
        assert!(!state.needs_response);

        let output = ReactBehaviour.extract_output(&agent, &state).unwrap();
        assert_eq!(output, Value::String("scattering".to_string()));
    }

    #[test]
    fn test_extract_output_falls_back_to_assistant_text() {
        let agent = agent();
        let mut state = fresh_state();
        state
            .messages
            .push(Message::assistant_text("direct answer without final_answer"));
        let output = ReactBehaviour.extract_output(&agent, &state).unwrap();
        assert_eq!(
            output,
            Value::String("direct answer without final_answer".to_string())
        );
    }

    #[test]
    fn test_duplicate_calls_recorded_not_suppressed() {
        let agent = agent();
        let mut state = fresh_state();
        let call = ToolCall::new("call_1", "search", json!({"q": "sky"}));

        ReactBehaviour.after_tool(&agent, &call, &json!({}), &mut state);
        ReactBehaviour.after_tool(&agent, &call, &json!({}), &mut state);

        let react = state.ctx.react.lock().unwrap();
        // Both identical calls are in the history; warning only, no dedup
        assert_eq!(react.tool_history.len(), 2);
        assert_eq!(react.tool_history[0], react.tool_history[1]);
    }
}
