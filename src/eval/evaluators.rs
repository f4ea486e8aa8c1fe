//! Built-in output evaluators.
//!
//! Each evaluator inspects a [`CaseOutcome`] against an expected value and
//! a kind-specific config, producing a uniform
//! `{passed, score in [0,1], reason, details}` verdict. The `llm_judge`
//! kind runs a separate judge agent and is the only async-expensive one;
//! `custom` delegates to a caller-supplied closure with the same shape.

use super::EvalType;
use crate::agent::{Agent, OutputType};
use crate::error::Result;
use crate::model::Model;
use crate::providers::ChatModel;
use crate::runner::{self, RunOptions, RunResult};
use crate::types::{ToolCall, Usage};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;

/// Evaluator verdict.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub passed: bool,
    /// Score in [0, 1]; graded evaluators report partial credit.
    pub score: f64,
    pub reason: Option<String>,
    pub details: Option<Value>,
}

impl Evaluation {
    pub fn pass(score: f64) -> Self {
        Self {
            passed: true,
            score,
            reason: None,
            details: None,
        }
    }

    pub fn fail(score: f64, reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            score,
            reason: Some(reason.into()),
            details: None,
        }
    }
}

/// What a case run produced, in the shape evaluators inspect.
#[derive(Debug, Clone)]
pub struct CaseOutcome {
    /// The run's output value.
    pub output: Value,
    /// Output rendered as text.
    pub text: String,
    /// Every tool call the agent made during the run.
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
}

impl CaseOutcome {
    pub fn from_run(result: &RunResult) -> Self {
        let tool_calls = result
            .new_messages
            .iter()
            .flat_map(|message| message.tool_calls().into_iter().cloned())
            .collect();
        Self {
            output: result.output.clone(),
            text: result.output_text(),
            tool_calls,
            usage: result.usage,
        }
    }
}

/// Caller-supplied evaluator: `(outcome, expected, config) -> evaluation`.
pub type CustomEvaluator = Arc<dyn Fn(&CaseOutcome, &Value, &Value) -> Evaluation + Send + Sync>;

/// Plug-in points consulted by [`evaluate`].
#[derive(Clone, Default)]
pub struct EvalHooks {
    /// Evaluator used for `eval_type: custom` cases.
    pub custom: Option<CustomEvaluator>,
    /// Model override for the judge agent (scripted in tests).
    pub judge_client: Option<Arc<dyn ChatModel>>,
}

/// Dispatches to the evaluator for `eval_type`.
pub async fn evaluate(
    eval_type: EvalType,
    outcome: &CaseOutcome,
    expected: &Value,
    config: &Value,
    hooks: &EvalHooks,
) -> Evaluation {
    match eval_type {
        EvalType::ExactMatch => exact_match(outcome, expected),
        EvalType::FuzzyMatch => fuzzy_match(outcome, expected, config),
        EvalType::Contains => contains(outcome, expected, config),
        EvalType::ToolUsage => tool_usage(outcome, config),
        EvalType::Schema => schema(outcome, expected, config),
        EvalType::LlmJudge => llm_judge(outcome, expected, config, hooks).await,
        EvalType::Custom => match &hooks.custom {
            Some(custom) => custom(outcome, expected, config),
            None => Evaluation::fail(0.0, "no custom evaluator registered"),
        },
    }
}

fn exact_match(outcome: &CaseOutcome, expected: &Value) -> Evaluation {
    let matched = match expected {
        Value::String(s) => outcome.text == *s,
        other => outcome.output == *other,
    };
    if matched {
        Evaluation::pass(1.0)
    } else {
        Evaluation::fail(0.0, format!("expected {:?}, got {:?}", expected, outcome.text))
    }
}

fn fuzzy_match(outcome: &CaseOutcome, expected: &Value, config: &Value) -> Evaluation {
    let expected_text = match expected.as_str() {
        Some(s) => s,
        None => return Evaluation::fail(0.0, "fuzzy_match expects a string"),
    };
    let threshold = config
        .get("threshold")
        .and_then(Value::as_f64)
        .unwrap_or(0.8);
    let similarity = strsim::jaro_winkler(&outcome.text, expected_text);
    Evaluation {
        passed: similarity >= threshold,
        score: similarity,
        reason: (similarity < threshold)
            .then(|| format!("similarity {:.3} below threshold {}", similarity, threshold)),
        details: Some(json!({"similarity": similarity, "threshold": threshold})),
    }
}

fn contains(outcome: &CaseOutcome, expected: &Value, config: &Value) -> Evaluation {
    let substrings: Vec<String> = config
        .get("substrings")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_else(|| match expected {
            Value::String(s) => vec![s.clone()],
            Value::Array(items) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        });
    let patterns: Vec<String> = config
        .get("patterns")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    if substrings.is_empty() && patterns.is_empty() {
        return Evaluation::fail(0.0, "contains has nothing to check");
    }

    let require_all = config
        .get("mode")
        .and_then(Value::as_str)
        .map(|mode| mode != "any")
        .unwrap_or(true);

    let matched_substrings = substrings
        .iter()
        .filter(|needle| outcome.text.contains(needle.as_str()))
        .count();
    let mut matched_patterns = 0usize;
    let mut bad_pattern = None;
    for pattern in &patterns {
        match Regex::new(pattern) {
            Ok(re) => {
                if re.is_match(&outcome.text) {
                    matched_patterns += 1;
                }
            }
            Err(err) => bad_pattern = Some(format!("invalid pattern '{}': {}", pattern, err)),
        }
    }
    if let Some(reason) = bad_pattern {
        return Evaluation::fail(0.0, reason);
    }

    let total = substrings.len() + patterns.len();
    let matched = matched_substrings + matched_patterns;
    let score = matched as f64 / total as f64;

    let substrings_ok = if require_all {
        matched_substrings == substrings.len()
    } else {
        substrings.is_empty() || matched_substrings > 0
    };
    // Regex patterns always all have to match.
    let patterns_ok = matched_patterns == patterns.len();

    Evaluation {
        passed: substrings_ok && patterns_ok,
        score,
        reason: (!(substrings_ok && patterns_ok))
            .then(|| format!("matched {}/{} checks", matched, total)),
        details: Some(json!({
            "matched_substrings": matched_substrings,
            "matched_patterns": matched_patterns,
        })),
    }
}

/// Shallow subset check: every key of `expected` equals the call's value.
fn args_subset(expected: &Value, actual: &Value) -> bool {
    match expected.as_object() {
        Some(expected) => expected
            .iter()
            .all(|(key, value)| actual.get(key) == Some(value)),
        None => false,
    }
}

fn tool_usage(outcome: &CaseOutcome, config: &Value) -> Evaluation {
    let called: Vec<&str> = outcome
        .tool_calls
        .iter()
        .map(|c| c.name.as_str())
        .collect();

    let mut checks = 0usize;
    let mut passed_checks = 0usize;
    let mut failures: Vec<String> = Vec::new();

    if let Some(required) = config.get("tools_called").and_then(Value::as_array) {
        for tool in required.iter().filter_map(Value::as_str) {
            checks += 1;
            if called.contains(&tool) {
                passed_checks += 1;
            } else {
                failures.push(format!("tool '{}' was not called", tool));
            }
        }
    }

    if let Some(forbidden) = config.get("tools_not_called").and_then(Value::as_array) {
        for tool in forbidden.iter().filter_map(Value::as_str) {
            checks += 1;
            if called.contains(&tool) {
                failures.push(format!("tool '{}' must not be called", tool));
            } else {
                passed_checks += 1;
            }
        }
    }

    if let Some(counts) = config.get("call_count").and_then(Value::as_object) {
        for (tool, expected_count) in counts {
            checks += 1;
            let actual = called.iter().filter(|name| *name == tool).count() as u64;
            if Some(actual) == expected_count.as_u64() {
                passed_checks += 1;
            } else {
                failures.push(format!(
                    "tool '{}' called {} time(s), expected {}",
                    tool, actual, expected_count
                ));
            }
        }
    }

    if let Some(args) = config.get("args_contain").and_then(Value::as_object) {
        for (tool, expected_args) in args {
            checks += 1;
            let matched = outcome
                .tool_calls
                .iter()
                .any(|call| call.name == *tool && args_subset(expected_args, &call.arguments));
            if matched {
                passed_checks += 1;
            } else {
                failures.push(format!(
                    "no call to '{}' contained arguments {}",
                    tool, expected_args
                ));
            }
        }
    }

    if checks == 0 {
        return Evaluation::fail(0.0, "tool_usage config has no expectations");
    }

    Evaluation {
        passed: failures.is_empty(),
        score: passed_checks as f64 / checks as f64,
        reason: (!failures.is_empty()).then(|| failures.join("; ")),
        details: Some(json!({"calls": called})),
    }
}

fn schema(outcome: &CaseOutcome, expected: &Value, config: &Value) -> Evaluation {
    let schema = config
        .get("schema")
        .cloned()
        .unwrap_or_else(|| expected.clone());
    if schema.is_null() {
        return Evaluation::fail(0.0, "schema evaluator has no schema");
    }

    let value = if outcome.output.is_string() {
        match crate::output::parse_json_text(&outcome.text) {
            Some(value) => value,
            None => return Evaluation::fail(0.0, "output is not parseable JSON"),
        }
    } else {
        outcome.output.clone()
    };

    match crate::output::validate(&schema, &value) {
        Ok(errors) if errors.is_empty() => Evaluation::pass(1.0),
        Ok(errors) => Evaluation::fail(
            0.0,
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        ),
        Err(err) => Evaluation::fail(0.0, err.to_string()),
    }
}

fn judge_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "score": {"type": "number", "minimum": 0.0, "maximum": 1.0},
            "reasoning": {"type": "string"},
        },
        "required": ["score", "reasoning"],
    })
}

async fn llm_judge(
    outcome: &CaseOutcome,
    expected: &Value,
    config: &Value,
    hooks: &EvalHooks,
) -> Evaluation {
    let criteria = match config.get("criteria").and_then(Value::as_str) {
        Some(criteria) => criteria,
        None => return Evaluation::fail(0.0, "llm_judge requires a 'criteria' config"),
    };
    let min_score = config
        .get("min_score")
        .and_then(Value::as_f64)
        .unwrap_or(0.7);
    let model_spec = config
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("openai:gpt-4o-mini");

    let judge = match build_judge(model_spec) {
        Ok(judge) => judge,
        Err(err) => return Evaluation::fail(0.0, format!("judge setup failed: {}", err)),
    };

    let mut prompt = format!(
        "Grade the following output against the criteria.\n\nCriteria: {}\n\nOutput:\n{}\n",
        criteria, outcome.text
    );
    if !expected.is_null() {
        let reference = match expected.as_str() {
            Some(s) => s.to_string(),
            None => expected.to_string(),
        };
        prompt.push_str(&format!("\nReference answer:\n{}\n", reference));
    }

    let run = match &hooks.judge_client {
        Some(client) => {
            runner::run_with_client(&judge, &prompt, RunOptions::default(), client.clone()).await
        }
        None => runner::run(&judge, &prompt, RunOptions::default()).await,
    };

    match run {
        Ok(result) => {
            let score = result
                .output
                .get("score")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            let reasoning = result
                .output
                .get("reasoning")
                .and_then(Value::as_str)
                .map(str::to_string);
            Evaluation {
                passed: score >= min_score,
                score,
                reason: reasoning,
                details: Some(json!({"min_score": min_score})),
            }
        }
        Err(err) => Evaluation::fail(0.0, format!("judge run failed: {}", err)),
    }
}

fn build_judge(model_spec: &str) -> Result<Agent> {
    Agent::builder()
        .name("llm-judge")
        .model(Model::parse(model_spec)?)
        .instructions(
            "You are an impartial judge. Grade the given output strictly against the \
             stated criteria and return a score between 0.0 and 1.0 with your reasoning.",
        )
        .output_type(OutputType::Schema(judge_schema()))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(text: &str) -> CaseOutcome {
        CaseOutcome {
            output: Value::String(text.to_string()),
            text: text.to_string(),
            tool_calls: Vec::new(),
            usage: Usage::new(),
        }
    }

    fn outcome_with_calls(calls: Vec<ToolCall>) -> CaseOutcome {
        CaseOutcome {
            output: Value::Null,
            text: String::new(),
            tool_calls: calls,
            usage: Usage::new(),
        }
    }

    #[tokio::test]
    async fn test_exact_match() {
        let hooks = EvalHooks::default();
        let verdict = evaluate(
            EvalType::ExactMatch,
            &outcome("5"),
            &json!("5"),
            &Value::Null,
            &hooks,
        )
        .await;
        assert!(verdict.passed);
        assert_eq!(verdict.score, 1.0);

        let verdict = evaluate(
            EvalType::ExactMatch,
            &outcome("6"),
            &json!("5"),
            &Value::Null,
            &hooks,
        )
        .await;
        assert!(!verdict.passed);
        assert_eq!(verdict.score, 0.0);
    }

    #[tokio::test]
    async fn test_fuzzy_match_threshold() {
        let hooks = EvalHooks::default();
        let verdict = evaluate(
            EvalType::FuzzyMatch,
            &outcome("colour"),
            &json!("color"),
            &Value::Null,
            &hooks,
        )
        .await;
        assert!(verdict.passed);
        assert!(verdict.score > 0.9);

        let verdict = evaluate(
            EvalType::FuzzyMatch,
            &outcome("entirely unrelated"),
            &json!("color"),
            &json!({"threshold": 0.95}),
            &hooks,
        )
        .await;
        assert!(!verdict.passed);
    }

    #[tokio::test]
    async fn test_contains_all_and_any() {
        let hooks = EvalHooks::default();
        let text = outcome("Paris is the capital of France");

        let verdict = evaluate(
            EvalType::Contains,
            &text,
            &json!(["Paris", "France"]),
            &Value::Null,
            &hooks,
        )
        .await;
        assert!(verdict.passed);
        assert_eq!(verdict.score, 1.0);

        let verdict = evaluate(
            EvalType::Contains,
            &text,
            &json!(["Paris", "Germany"]),
            &Value::Null,
            &hooks,
        )
        .await;
        assert!(!verdict.passed);
        assert_eq!(verdict.score, 0.5);

        let verdict = evaluate(
            EvalType::Contains,
            &text,
            &json!(["Paris", "Germany"]),
            &json!({"mode": "any"}),
            &hooks,
        )
        .await;
        assert!(verdict.passed);
    }

    #[tokio::test]
    async fn test_contains_regex_patterns() {
        let hooks = EvalHooks::default();
        let verdict = evaluate(
            EvalType::Contains,
            &outcome("The answer is 42."),
            &Value::Null,
            &json!({"patterns": ["answer is \\d+"]}),
            &hooks,
        )
        .await;
        assert!(verdict.passed);

        let verdict = evaluate(
            EvalType::Contains,
            &outcome("The answer is forty-two."),
            &Value::Null,
            &json!({"patterns": ["answer is \\d+"]}),
            &hooks,
        )
        .await;
        assert!(!verdict.passed);
    }

    #[tokio::test]
    async fn test_tool_usage_checks() {
        let hooks = EvalHooks::default();
        let calls = outcome_with_calls(vec![
            ToolCall::new("c1", "search", json!({"q": "rust", "lang": "en"})),
            ToolCall::new("c2", "search", json!({"q": "tokio"})),
            ToolCall::new("c3", "summarize", json!({})),
        ]);

        let verdict = evaluate(
            EvalType::ToolUsage,
            &calls,
            &Value::Null,
            &json!({
                "tools_called": ["search", "summarize"],
                "tools_not_called": ["delete"],
                "call_count": {"search": 2},
                "args_contain": {"search": {"q": "rust"}},
            }),
            &hooks,
        )
        .await;
        assert!(verdict.passed, "reason: {:?}", verdict.reason);
        assert_eq!(verdict.score, 1.0);

        let verdict = evaluate(
            EvalType::ToolUsage,
            &calls,
            &Value::Null,
            &json!({"tools_not_called": ["search"], "tools_called": ["summarize"]}),
            &hooks,
        )
        .await;
        assert!(!verdict.passed);
        assert_eq!(verdict.score, 0.5);
    }

    #[tokio::test]
    async fn test_schema_evaluator() {
        let hooks = EvalHooks::default();
        let schema = json!({
            "type": "object",
            "properties": {"name": {"type": "string"}},
            "required": ["name"],
        });

        let verdict = evaluate(
            EvalType::Schema,
            &outcome("{\"name\": \"ada\"}"),
            &schema,
            &Value::Null,
            &hooks,
        )
        .await;
        assert!(verdict.passed);

        let verdict = evaluate(
            EvalType::Schema,
            &outcome("{\"age\": 7}"),
            &schema,
            &Value::Null,
            &hooks,
        )
        .await;
        assert!(!verdict.passed);
        assert_eq!(verdict.score, 0.0);
    }

    #[tokio::test]
    async fn test_custom_evaluator() {
        let hooks = EvalHooks {
            custom: Some(Arc::new(|outcome, _expected, _config| {
                Evaluation {
                    passed: outcome.text.len() < 10,
                    score: 1.0,
                    reason: None,
                    details: None,
                }
            })),
            judge_client: None,
        };
        let verdict = evaluate(
            EvalType::Custom,
            &outcome("short"),
            &Value::Null,
            &Value::Null,
            &hooks,
        )
        .await;
        assert!(verdict.passed);

        let missing = evaluate(
            EvalType::Custom,
            &outcome("short"),
            &Value::Null,
            &Value::Null,
            &EvalHooks::default(),
        )
        .await;
        assert!(!missing.passed);
    }

    #[tokio::test]
    async fn test_llm_judge_requires_criteria() {
        let verdict = evaluate(
            EvalType::LlmJudge,
            &outcome("whatever"),
            &Value::Null,
            &Value::Null,
            &EvalHooks::default(),
        )
        .await;
        assert!(!verdict.passed);
        assert!(verdict.reason.unwrap().contains("criteria"));
    }
}
