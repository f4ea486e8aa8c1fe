//! The default request/response strategy.
//!
//! Basic prepends the agent's instructions as a system message when the
//! transcript has none, appends each assistant response, and keeps looping
//! exactly as long as the response carries tool calls. Output is the last
//! assistant's text, or the structured-output candidate when the agent has
//! a schema output type.

use super::Behaviour;
use crate::agent::{Agent, OutputType};
use crate::context::RunState;
use crate::providers::ChatResponse;
use crate::tools::Tool;
use crate::types::{Message, Role, ToolCall};
use serde_json::Value;
use std::sync::Arc;

pub struct BasicBehaviour;

impl Behaviour for BasicBehaviour {
    fn init_context(&self, _agent: &Agent, _state: &mut RunState) {}

    fn build_messages(&self, agent: &Agent, state: &RunState) -> Vec<Message> {
        let mut messages = Vec::with_capacity(state.messages.len() + 1);
        let has_system = state.messages.iter().any(|m| matches!(m.role, Role::System));
        if !has_system {
            if let Some(instructions) = agent.instructions_text(&state.ctx) {
                messages.push(Message::system(instructions));
            }
        }
        messages.extend(state.messages.iter().cloned());
        messages
    }

    fn process_response(&self, _agent: &Agent, response: &ChatResponse, state: &mut RunState) {
        state.needs_response = response.message.has_tool_calls();
        state.messages.push(response.message.clone());
    }

    fn extract_output(&self, agent: &Agent, state: &RunState) -> Option<Value> {
        match agent.output_type() {
            OutputType::Text | OutputType::Choice(_) | OutputType::Regex(_)
            | OutputType::Grammar(_) => state
                .last_assistant()
                .map(|message| Value::String(message.text())),
            OutputType::Schema(_) => crate::output::extract_candidate(agent, state),
        }
    }

    fn get_tools(&self, agent: &Agent) -> Vec<Arc<Tool>> {
        agent.tools().to_vec()
    }

    fn after_tool(&self, _agent: &Agent, _call: &ToolCall, _result: &Value, _state: &mut RunState) {
    }
}
