//! Tool executor: resolves, validates, invokes, retries.
//!
//! Errors local to a tool call are never run failures. Unknown names,
//! unparsable arguments, timeouts, and handler errors all come back as the
//! tool's *result*, so the model sees what went wrong on the next iteration
//! and can correct itself. Only the runner's own bookkeeping (usage limits,
//! cancellation) aborts a run.
//!
//! A tool result map may carry the reserved [`UPDATE_CONTEXT_KEY`]; the
//! executor strips it and hands the sub-map back separately as a context
//! patch, so the key is never visible to the model.

use crate::context::RunContext;
use crate::retry::RetryConfig;
use crate::telemetry::{self, Span, TOOL_EXECUTE};
use crate::tools::{sanitize_tool_name, Tool, UPDATE_CONTEXT_KEY};
use crate::types::ToolCall;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// What a tool invocation produced.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// The call this outcome answers.
    pub call_id: String,
    /// Result value sent back to the model (error descriptions included).
    pub result: Value,
    /// Deps patch extracted from the reserved result key, if any. Applied
    /// by the runner before the next iteration.
    pub context_patch: Option<Map<String, Value>>,
    /// True when the result describes a failure rather than a success.
    pub failed: bool,
}

impl ToolOutcome {
    fn success(call_id: &str, result: Value, context_patch: Option<Map<String, Value>>) -> Self {
        Self {
            call_id: call_id.to_string(),
            result,
            context_patch,
            failed: false,
        }
    }

    fn failure(call_id: &str, message: String) -> Self {
        Self {
            call_id: call_id.to_string(),
            result: json!({ "error": message }),
            context_patch: None,
            failed: true,
        }
    }
}

/// Executes one tool call against the agent's tool list.
///
/// `default_timeout` applies when the tool itself has none.
pub async fn execute(
    tools: &[Arc<Tool>],
    call: &ToolCall,
    ctx: &RunContext,
    default_timeout: Duration,
) -> ToolOutcome {
    // Providers occasionally append XML-ish noise to the name.
    let name = sanitize_tool_name(&call.name);

    let Some(tool) = tools.iter().find(|t| t.name() == name) else {
        return ToolOutcome::failure(&call.id, format!("Tool not found: {}", name));
    };

    if tool.requires_approval() && !ctx.is_approved(name) {
        return ToolOutcome::failure(
            &call.id,
            format!("Tool '{}' requires approval and none was granted", name),
        );
    }

    // Arguments may still be the raw string when the provider delivered
    // unparsable JSON; the parse failure belongs to the model.
    let arguments = match &call.arguments {
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                return ToolOutcome::failure(
                    &call.id,
                    format!("Invalid tool arguments for '{}': {}", name, err),
                );
            }
        },
        other => other.clone(),
    };

    let tool_timeout = tool.timeout().unwrap_or(default_timeout);
    let backoff = RetryConfig::for_tools(tool.retries() + 1);
    let attempts = tool.retries() + 1;
    let mut last_error = String::new();

    for attempt in 0..attempts {
        let mut metadata = telemetry::meta(&[("tool_name", name)]);
        metadata.insert("attempt".to_string(), Value::from(attempt + 1));
        let span = Span::start(TOOL_EXECUTE, metadata);

        match timeout(tool_timeout, tool.invoke(ctx.clone(), arguments.clone())).await {
            Ok(Ok(result)) => {
                span.stop(Map::new());
                let (result, patch) = split_context_patch(result);
                return ToolOutcome::success(&call.id, result, patch);
            }
            Ok(Err(err)) => {
                last_error = err.to_string();
                span.exception(&last_error);
                log::debug!(
                    "tool '{}' attempt {}/{} failed: {}",
                    name,
                    attempt + 1,
                    attempts,
                    last_error
                );
                if attempt + 1 < attempts {
                    tokio::time::sleep(backoff.delay_for(attempt)).await;
                }
            }
            Err(_elapsed) => {
                span.exception("tool_timeout");
                return ToolOutcome::failure(
                    &call.id,
                    format!("tool_timeout: '{}' exceeded {:?}", name, tool_timeout),
                );
            }
        }

        if ctx.is_cancelled() {
            return ToolOutcome::failure(&call.id, "tool aborted: run cancelled".to_string());
        }
    }

    ToolOutcome::failure(
        &call.id,
        format!(
            "Tool '{}' failed after {} attempt(s): {}",
            name, attempts, last_error
        ),
    )
}

/// Splits the reserved context-update key out of a tool result.
fn split_context_patch(result: Value) -> (Value, Option<Map<String, Value>>) {
    let Value::Object(mut obj) = result else {
        return (result, None);
    };
    let patch = match obj.remove(UPDATE_CONTEXT_KEY) {
        Some(Value::Object(patch)) => Some(patch),
        // A non-map value under the reserved key is dropped, not forwarded.
        Some(_) => None,
        None => None,
    };
    (Value::Object(obj), patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CancellationToken, Deps};
    use crate::tools::tool;
    use crate::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ctx() -> RunContext {
        RunContext::default()
    }

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall::new("call_1", name, args)
    }

    #[tokio::test]
    async fn test_successful_execution() {
        let tools = vec![Arc::new(
            tool("add", "Add").param("a", "number").param("b", "number").build(
                |_ctx, args| async move {
                    Ok(json!({"result": args["a"].as_f64().unwrap() + args["b"].as_f64().unwrap()}))
                },
            ),
        )];
        let outcome = execute(
            &tools,
            &call("add", json!({"a": 2.0, "b": 3.0})),
            &ctx(),
            Duration::from_secs(1),
        )
        .await;
        assert!(!outcome.failed);
        assert_eq!(outcome.result["result"], 5.0);
        assert_eq!(outcome.call_id, "call_1");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_a_result_not_a_failure() {
        let tools: Vec<Arc<Tool>> = Vec::new();
        let outcome = execute(
            &tools,
            &call("does_not_exist", json!({})),
            &ctx(),
            Duration::from_secs(1),
        )
        .await;
        assert!(outcome.failed);
        assert_eq!(outcome.result["error"], "Tool not found: does_not_exist");
    }

    #[tokio::test]
    async fn test_name_sanitization() {
        let tools = vec![Arc::new(
            tool("add", "Add").build(|_ctx, _args| async move { Ok(json!({"ok": true})) }),
        )];
        let outcome = execute(
            &tools,
            &call("add</tool_call>", json!({})),
            &ctx(),
            Duration::from_secs(1),
        )
        .await;
        assert!(!outcome.failed);
    }

    #[tokio::test]
    async fn test_string_arguments_are_parsed() {
        let tools = vec![Arc::new(tool("echo", "Echo").build(|_ctx, args| async move {
            Ok(json!({"echoed": args}))
        }))];
        let outcome = execute(
            &tools,
            &call("echo", Value::String("{\"q\": \"elixir\"}".to_string())),
            &ctx(),
            Duration::from_secs(1),
        )
        .await;
        assert!(!outcome.failed);
        assert_eq!(outcome.result["echoed"], json!({"q": "elixir"}));
    }

    #[tokio::test]
    async fn test_unparsable_arguments_surface_to_model() {
        let tools = vec![Arc::new(
            tool("echo", "Echo").build(|_ctx, _args| async move { Ok(json!({})) }),
        )];
        let outcome = execute(
            &tools,
            &call("echo", Value::String("{broken".to_string())),
            &ctx(),
            Duration::from_secs(1),
        )
        .await;
        assert!(outcome.failed);
        assert!(outcome.result["error"]
            .as_str()
            .unwrap()
            .contains("Invalid tool arguments"));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        static CALLS: AtomicU32 = AtomicU32::new(0);
        let tools = vec![Arc::new(
            tool("flaky", "Fails twice")
                .retries(2)
                .build(|_ctx, _args| async move {
                    let n = CALLS.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(Error::tool("transient"))
                    } else {
                        Ok(json!({"attempt": n}))
                    }
                }),
        )];
        let outcome = execute(&tools, &call("flaky", json!({})), &ctx(), Duration::from_secs(1))
            .await;
        assert!(!outcome.failed);
        assert_eq!(outcome.result["attempt"], 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_reports_last_error() {
        let tools = vec![Arc::new(tool("broken", "Always fails").retries(1).build(
            |_ctx, _args| async move { Err::<Value, _>(Error::tool("kaput")) },
        ))];
        let outcome = execute(
            &tools,
            &call("broken", json!({})),
            &ctx(),
            Duration::from_secs(1),
        )
        .await;
        assert!(outcome.failed);
        let msg = outcome.result["error"].as_str().unwrap();
        assert!(msg.contains("2 attempt(s)"));
        assert!(msg.contains("kaput"));
    }

    #[tokio::test]
    async fn test_timeout_yields_tool_timeout_result() {
        let tools = vec![Arc::new(tool("slow", "Sleeps forever").build(
            |_ctx, _args| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!({}))
            },
        ))];
        let outcome = execute(
            &tools,
            &call("slow", json!({})),
            &ctx(),
            Duration::from_millis(20),
        )
        .await;
        assert!(outcome.failed);
        assert!(outcome.result["error"]
            .as_str()
            .unwrap()
            .starts_with("tool_timeout"));
    }

    #[tokio::test]
    async fn test_context_patch_extracted_and_hidden() {
        let tools = vec![Arc::new(tool("login", "Start a session").build(
            |_ctx, _args| async move {
                Ok(json!({
                    "status": "ok",
                    "__update_context__": {"session_id": "s-42"},
                }))
            },
        ))];
        let outcome = execute(
            &tools,
            &call("login", json!({})),
            &ctx(),
            Duration::from_secs(1),
        )
        .await;
        assert!(!outcome.failed);
        // The reserved key never reaches the model
        assert!(outcome.result.get(UPDATE_CONTEXT_KEY).is_none());
        assert_eq!(outcome.result, json!({"status": "ok"}));
        let patch = outcome.context_patch.unwrap();
        assert_eq!(patch.get("session_id"), Some(&json!("s-42")));
    }

    #[tokio::test]
    async fn test_approval_gate() {
        let tools = vec![Arc::new(
            tool("rm", "Delete")
                .requires_approval()
                .build(|_ctx, _args| async move { Ok(json!({"deleted": true})) }),
        )];

        let denied = execute(&tools, &call("rm", json!({})), &ctx(), Duration::from_secs(1)).await;
        assert!(denied.failed);
        assert!(denied.result["error"].as_str().unwrap().contains("approval"));

        let mut approved = std::collections::HashSet::new();
        approved.insert("rm".to_string());
        let ctx = RunContext::new(Deps::new(), CancellationToken::new(), approved);
        let allowed = execute(&tools, &call("rm", json!({})), &ctx, Duration::from_secs(1)).await;
        assert!(!allowed.failed);
    }
}
