//! Suite execution: bounded parallelism, retries, timeouts, aggregation.
//!
//! Cases run concurrently up to the configured parallelism. Failures stay
//! local: a case whose run errors (or times out) is recorded with its
//! error and score 0 while its siblings continue. Cases whose *run* failed
//! are retried with a linear backoff (100 ms x attempt); evaluator
//! verdicts are never retried.

use super::evaluators::{self, CaseOutcome, EvalHooks};
use super::{CaseMetrics, CaseResult, PriceTable, Suite, SuiteResult, TestCase};
use crate::agent::Agent;
use crate::context::Deps;
use crate::error::{Error, Result};
use crate::model::{Model, ModelSettings};
use crate::providers::ChatModel;
use crate::runner::{self, RunOptions};
use crate::tools::Tool;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Async hook run before the suite; its return becomes each case's `deps`.
pub type SetupFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Deps>> + Send + Sync>;
/// Async hook run after the suite completes.
pub type TeardownFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Options controlling one suite run.
#[derive(Clone)]
pub struct EvalOptions {
    /// Include only cases carrying one of these tags (all when empty).
    pub tags: Vec<String>,
    /// Exclude cases carrying one of these tags.
    pub exclude_tags: Vec<String>,
    /// Overrides the suite/case model.
    pub model_override: Option<String>,
    /// Overrides the suite/case instructions.
    pub instructions_override: Option<String>,
    /// Settings merged over each case's agent settings.
    pub settings_override: Option<ModelSettings>,
    /// Concurrent case bound; overrides the suite's `parallelism`.
    pub parallelism: Option<usize>,
    /// Per-case timeout override in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Run-retry override; see the suite's `retry_failed`.
    pub retry_failed: Option<u32>,
    /// Model-request bound per case run.
    pub max_iterations: u32,
    /// Tools cases may reference by name.
    pub tools: Vec<Arc<Tool>>,
    /// Scripted model for tests; real provider dispatch when unset.
    pub client: Option<Arc<dyn ChatModel>>,
    /// Custom evaluator and judge plumbing.
    pub hooks: EvalHooks,
    pub setup: Option<SetupFn>,
    pub teardown: Option<TeardownFn>,
    /// Prices per model spec for cost aggregation.
    pub prices: PriceTable,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            exclude_tags: Vec::new(),
            model_override: None,
            instructions_override: None,
            settings_override: None,
            parallelism: None,
            timeout_ms: None,
            retry_failed: None,
            max_iterations: 10,
            tools: Vec::new(),
            client: None,
            hooks: EvalHooks::default(),
            setup: None,
            teardown: None,
            prices: PriceTable::new(),
        }
    }
}

/// A/B comparison verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    A,
    B,
    Tie,
}

/// Result of running the same suite under two configurations.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Comparison {
    pub a: SuiteResult,
    pub b: SuiteResult,
    pub winner: Winner,
}

// The margin an aggregate score must win by.
const COMPARISON_THRESHOLD: f64 = 0.05;

/// Runs every (filtered) case of a suite and aggregates the results.
pub async fn run_suite(suite: &Suite, options: &EvalOptions) -> Result<SuiteResult> {
    suite.validate()?;

    let cases: Vec<TestCase> = suite
        .filtered_cases(&options.tags, &options.exclude_tags)
        .into_iter()
        .cloned()
        .collect();

    let deps = match &options.setup {
        Some(setup) => setup().await?,
        None => Deps::new(),
    };

    let parallelism = options
        .parallelism
        .or(suite.parallelism)
        .unwrap_or(1)
        .max(1);

    let started = Instant::now();
    let results: Vec<CaseResult> = stream::iter(cases)
        .map(|case| {
            let deps = deps.clone();
            async move { run_case(suite, &case, options, deps).await }
        })
        .buffer_unordered(parallelism)
        .collect()
        .await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let cost = total_cost(suite, options, &results);
    let aggregated = SuiteResult::from_results(suite.name.clone(), results, duration_ms, cost);

    if let Some(teardown) = &options.teardown {
        teardown().await?;
    }

    Ok(aggregated)
}

/// Runs one suite under two option sets and declares a winner when the
/// aggregate scores differ by more than 0.05.
pub async fn compare_suites(
    suite: &Suite,
    options_a: &EvalOptions,
    options_b: &EvalOptions,
) -> Result<Comparison> {
    let a = run_suite(suite, options_a).await?;
    let b = run_suite(suite, options_b).await?;
    let winner = if a.mean_score - b.mean_score > COMPARISON_THRESHOLD {
        Winner::A
    } else if b.mean_score - a.mean_score > COMPARISON_THRESHOLD {
        Winner::B
    } else {
        Winner::Tie
    };
    Ok(Comparison { a, b, winner })
}

fn case_model_spec<'a>(
    suite: &'a Suite,
    case: &'a TestCase,
    options: &'a EvalOptions,
) -> Option<&'a str> {
    options
        .model_override
        .as_deref()
        .or(case.agent_config.as_ref().and_then(|c| c.model.as_deref()))
        .or(suite.default_model.as_deref())
}

fn build_case_agent(suite: &Suite, case: &TestCase, options: &EvalOptions) -> Result<Agent> {
    let model_spec = case_model_spec(suite, case, options).ok_or_else(|| {
        Error::configuration(format!(
            "case '{}' has no model (set default_model, agent_config.model, or --model)",
            case.id
        ))
    })?;

    let instructions = options
        .instructions_override
        .clone()
        .or_else(|| {
            case.agent_config
                .as_ref()
                .and_then(|c| c.instructions.clone())
        })
        .or_else(|| suite.default_instructions.clone());

    let mut settings = case
        .agent_config
        .as_ref()
        .and_then(|c| c.settings.clone())
        .unwrap_or_default();
    if let Some(overrides) = &options.settings_override {
        settings = settings.merged(overrides);
    }

    let tools: Vec<Arc<Tool>> = match &case.tools {
        Some(names) => options
            .tools
            .iter()
            .filter(|tool| names.iter().any(|name| name == tool.name()))
            .cloned()
            .collect(),
        None => options.tools.clone(),
    };

    let mut builder = Agent::builder()
        .name(format!("eval:{}", case.id))
        .model(Model::parse(model_spec)?)
        .settings(settings)
        .shared_tools(tools);
    if let Some(instructions) = instructions {
        builder = builder.instructions(instructions);
    }
    builder.build()
}

async fn run_case(
    suite: &Suite,
    case: &TestCase,
    options: &EvalOptions,
    deps: Deps,
) -> CaseResult {
    let timeout_ms = case
        .timeout_ms
        .or(options.timeout_ms)
        .or(suite.default_timeout_ms)
        .unwrap_or(60_000);
    let attempts = options.retry_failed.or(suite.retry_failed).unwrap_or(0) + 1;

    let agent = match build_case_agent(suite, case, options) {
        Ok(agent) => agent,
        Err(err) => return error_result(case, 0, err.to_string()),
    };

    let started = Instant::now();
    let mut last_error = String::new();

    for attempt in 0..attempts {
        let run_options = RunOptions {
            deps: deps.clone(),
            max_iterations: options.max_iterations,
            ..RunOptions::default()
        };

        let run = async {
            match &options.client {
                Some(client) => {
                    runner::run_with_client(&agent, &case.input, run_options, client.clone()).await
                }
                None => runner::run(&agent, &case.input, run_options).await,
            }
        };

        match tokio::time::timeout(Duration::from_millis(timeout_ms), run).await {
            Ok(Ok(result)) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                let outcome = CaseOutcome::from_run(&result);
                let verdict = evaluators::evaluate(
                    case.eval_type,
                    &outcome,
                    &case.expected,
                    &case.eval_config,
                    &options.hooks,
                )
                .await;
                return CaseResult {
                    id: case.id.clone(),
                    name: case.name.clone(),
                    passed: verdict.passed,
                    score: verdict.score,
                    actual: outcome.output,
                    expected: case.expected.clone(),
                    metrics: CaseMetrics {
                        duration_ms,
                        usage: result.usage,
                    },
                    reason: verdict.reason,
                    error: None,
                };
            }
            Ok(Err(err)) => {
                last_error = format!("{}: {}", err.code(), err);
            }
            Err(_elapsed) => {
                last_error = "timeout".to_string();
            }
        }

        if attempt + 1 < attempts {
            tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
        }
    }

    error_result(case, started.elapsed().as_millis() as u64, last_error)
}

fn error_result(case: &TestCase, duration_ms: u64, error: String) -> CaseResult {
    CaseResult {
        id: case.id.clone(),
        name: case.name.clone(),
        passed: false,
        score: 0.0,
        actual: Value::Null,
        expected: case.expected.clone(),
        metrics: CaseMetrics {
            duration_ms,
            usage: Default::default(),
        },
        reason: None,
        error: Some(error),
    }
}

/// Cost across cases from the price table, when one was supplied. Cases
/// whose model has no price entry contribute nothing.
fn total_cost(suite: &Suite, options: &EvalOptions, results: &[CaseResult]) -> Option<f64> {
    if options.prices.is_empty() {
        return None;
    }
    let mut total = 0.0;
    for result in results {
        let case = suite.test_cases.iter().find(|c| c.id == result.id)?;
        if let Some(price) = case_model_spec(suite, case, options)
            .and_then(|spec| options.prices.get(spec))
        {
            total += price.cost(&result.metrics.usage);
        }
    }
    Some(total)
}
