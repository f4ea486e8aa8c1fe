//! Pluggable agent strategies.
//!
//! A behaviour decides how the runner assembles requests, interprets
//! responses, and extracts the final output. The capability set is fixed:
//! seed private state, build the pre-request messages, process a response,
//! extract the output, list the tools, and observe each tool result. The
//! runner is the only caller; behaviours never call each other.
//!
//! Two strategies ship built in: [`basic::BasicBehaviour`] (plain
//! request/response with tool calls) and [`react::ReactBehaviour`]
//! (explicit plan / track todos / act / final-answer workflow driven by
//! synthetic tools).

pub mod basic;
pub mod react;

use crate::agent::Agent;
use crate::context::RunState;
use crate::providers::ChatResponse;
use crate::tools::Tool;
use crate::types::ToolCall;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// The strategy interface the runner drives.
///
/// All methods are pure with respect to their explicit state argument:
/// behaviour-private data lives in the run's state, never in the behaviour
/// value itself, so one `&'static` behaviour instance serves every run.
pub trait Behaviour: Send + Sync {
    /// Seeds behaviour-private state at the start of a run.
    fn init_context(&self, agent: &Agent, state: &mut RunState);

    /// Assembles the message list for the next model request.
    fn build_messages(&self, agent: &Agent, state: &RunState) -> Vec<crate::types::Message>;

    /// Records a model response into the state and decides whether the
    /// loop needs another response (`state.needs_response`).
    fn process_response(&self, agent: &Agent, response: &ChatResponse, state: &mut RunState);

    /// Extracts the run's output from the final state, or `None` when the
    /// run produced nothing extractable.
    fn extract_output(&self, agent: &Agent, state: &RunState) -> Option<Value>;

    /// The tools offered to the model; may add behaviour-synthetic tools
    /// to the agent's own.
    fn get_tools(&self, agent: &Agent) -> Vec<Arc<Tool>>;

    /// Hook invoked after every tool execution (bookkeeping, loop
    /// detection). Runs even for results delivered right before
    /// cancellation.
    fn after_tool(&self, agent: &Agent, call: &ToolCall, result: &Value, state: &mut RunState);
}

/// Selects a built-in behaviour on an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BehaviourKind {
    #[default]
    Basic,
    React,
}

impl BehaviourKind {
    /// The shared instance implementing this strategy.
    pub fn instance(&self) -> &'static dyn Behaviour {
        match self {
            BehaviourKind::Basic => &basic::BasicBehaviour,
            BehaviourKind::React => &react::ReactBehaviour,
        }
    }
}
