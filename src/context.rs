//! Per-run state: dependencies, usage accounting, cancellation.
//!
//! A [`RunContext`] is a cheaply-cloneable handle to the state of one agent
//! run. Tools receive a clone with every invocation, so a tool can read the
//! caller-supplied `deps` map and (through the executor's context patches)
//! influence the `deps` seen by later iterations. The context lives exactly
//! as long as one call to `run`; nothing in it is shared across runs unless
//! the caller passes shared values inside `deps`.

use crate::types::{Message, Usage};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Opaque dependency map handed to every tool call.
pub type Deps = Map<String, Value>;

/// Cooperative cancellation signal for a run.
///
/// The runner checks it before each iteration and returns
/// `execution_cancelled` once observed; clones share the flag, so handing
/// the token to in-flight tools lets them abort promptly too. Safe to
/// cancel multiple times.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Shared handle to one run's mutable state.
#[derive(Clone, Default)]
pub struct RunContext {
    deps: Arc<Mutex<Deps>>,
    usage: Arc<Mutex<Usage>>,
    cancellation: CancellationToken,
    approved_tools: Arc<HashSet<String>>,
    pub(crate) react: Arc<Mutex<crate::behaviour::react::ReactState>>,
}

impl RunContext {
    pub fn new(
        deps: Deps,
        cancellation: CancellationToken,
        approved_tools: HashSet<String>,
    ) -> Self {
        Self {
            deps: Arc::new(Mutex::new(deps)),
            usage: Arc::new(Mutex::new(Usage::new())),
            cancellation,
            approved_tools: Arc::new(approved_tools),
            react: Arc::new(Mutex::new(Default::default())),
        }
    }

    /// Snapshot of the current dependency map.
    pub fn deps(&self) -> Deps {
        self.deps.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Looks up a single dependency by key.
    pub fn dep(&self, key: &str) -> Option<Value> {
        self.deps.lock().ok().and_then(|d| d.get(key).cloned())
    }

    /// Merges a context patch into `deps`. Applied by the runner between
    /// iterations; the patched keys are visible to every later tool call
    /// of the same run only.
    pub(crate) fn merge_deps(&self, patch: Deps) {
        if let Ok(mut deps) = self.deps.lock() {
            for (k, v) in patch {
                deps.insert(k, v);
            }
        }
    }

    /// Current accumulated usage.
    pub fn usage(&self) -> Usage {
        self.usage.lock().map(|u| *u).unwrap_or_default()
    }

    pub(crate) fn record_usage(&self, delta: &Usage) {
        if let Ok(mut usage) = self.usage.lock() {
            usage.add(delta);
        }
    }

    pub(crate) fn record_tool_calls(&self, n: u64) {
        if let Ok(mut usage) = self.usage.lock() {
            usage.inc_tool_calls(n);
        }
    }

    /// The run's cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Whether a tool marked `requires_approval` has been pre-approved for
    /// this run.
    pub fn is_approved(&self, tool_name: &str) -> bool {
        self.approved_tools.contains(tool_name)
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("usage", &self.usage())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// The full state the runner threads through one run: the message
/// transcript plus the shared [`RunContext`]. Behaviours read and mutate
/// this; tools only ever see the context handle.
pub struct RunState {
    /// Every message of the run in production order (history included).
    pub messages: Vec<Message>,
    /// Index into `messages` where this run's new messages begin.
    pub new_from: usize,
    /// Whether the loop should request another model response.
    pub needs_response: bool,
    /// Completed loop iterations.
    pub iterations: u32,
    pub ctx: RunContext,
}

impl RunState {
    pub fn new(history: Vec<Message>, ctx: RunContext) -> Self {
        let new_from = history.len();
        Self {
            messages: history,
            new_from,
            needs_response: true,
            iterations: 0,
            ctx,
        }
    }

    /// Messages produced during this run (excludes supplied history).
    pub fn new_messages(&self) -> &[Message] {
        &self.messages[self.new_from.min(self.messages.len())..]
    }

    /// The most recent assistant message, if any.
    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::types::Role::Assistant))
    }
}
