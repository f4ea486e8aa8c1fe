//! Evaluation suites: cases, results, aggregation.
//!
//! A [`Suite`] groups test cases with shared defaults and loads from YAML:
//!
//! ```yaml
//! name: arithmetic
//! default_model: "openai:gpt-4o-mini"
//! test_cases:
//!   - id: add-small
//!     input: "What is 2+3? Answer with just the number."
//!     expected: "5"
//!     eval_type: exact_match
//!     tags: [math]
//! ```
//!
//! Aggregation is permutation-invariant: the same set of case results
//! produces the same [`SuiteResult`] regardless of completion order, and
//! the per-case report is stable, sorted by case id.

pub mod evaluators;
pub mod runner;

pub use evaluators::{CaseOutcome, CustomEvaluator, EvalHooks, Evaluation};
pub use runner::{compare_suites, run_suite, Comparison, EvalOptions, Winner};

use crate::error::{Error, Result};
use crate::model::ModelSettings;
use crate::types::Usage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

/// Built-in evaluator kinds, plus `custom` for a caller-supplied one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalType {
    ExactMatch,
    FuzzyMatch,
    Contains,
    ToolUsage,
    Schema,
    LlmJudge,
    Custom,
}

/// Per-case agent overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaseAgentConfig {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub settings: Option<ModelSettings>,
}

/// One evaluation case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// The prompt given to the agent.
    pub input: String,
    /// What the evaluator compares against (shape depends on the kind).
    #[serde(default)]
    pub expected: Value,
    pub eval_type: EvalType,
    #[serde(default)]
    pub eval_config: Value,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub agent_config: Option<CaseAgentConfig>,
    /// Names of registered tools this case may use; all when omitted.
    #[serde(default)]
    pub tools: Option<Vec<String>>,
    /// Per-case timeout in milliseconds.
    #[serde(default, rename = "timeout")]
    pub timeout_ms: Option<u64>,
}

/// A named group of cases with shared defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suite {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub default_instructions: Option<String>,
    /// Default per-case timeout in milliseconds.
    #[serde(default, rename = "default_timeout")]
    pub default_timeout_ms: Option<u64>,
    /// Cases run concurrently up to this bound (default 1).
    #[serde(default)]
    pub parallelism: Option<usize>,
    /// Re-run attempts for cases whose run errored.
    #[serde(default)]
    pub retry_failed: Option<u32>,
    pub test_cases: Vec<TestCase>,
}

impl Suite {
    /// Parses a suite from YAML text.
    pub fn from_yaml_str(yaml: &str) -> Result<Suite> {
        let suite: Suite = serde_yaml::from_str(yaml)
            .map_err(|err| Error::configuration(format!("invalid suite file: {}", err)))?;
        suite.validate()?;
        Ok(suite)
    }

    /// Loads a suite from a `.yaml`/`.yml` file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Suite> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            Error::configuration(format!("cannot read suite {}: {}", path.display(), err))
        })?;
        Suite::from_yaml_str(&text)
    }

    /// Loads every `.yaml`/`.yml` suite in a directory, sorted by file
    /// name.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Vec<Suite>> {
        let dir = dir.as_ref();
        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .map_err(|err| {
                Error::configuration(format!("cannot read suite dir {}: {}", dir.display(), err))
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        paths.sort();
        paths.into_iter().map(Suite::from_path).collect()
    }

    /// Structural validation: non-empty name and cases, unique non-empty
    /// case ids, non-empty inputs.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::configuration("suite name is empty"));
        }
        if self.test_cases.is_empty() {
            return Err(Error::configuration(format!(
                "suite '{}' has no test cases",
                self.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for case in &self.test_cases {
            if case.id.trim().is_empty() {
                return Err(Error::configuration(format!(
                    "suite '{}' has a case with an empty id",
                    self.name
                )));
            }
            if !seen.insert(case.id.as_str()) {
                return Err(Error::configuration(format!(
                    "suite '{}' has a duplicate case id '{}'",
                    self.name, case.id
                )));
            }
            if case.input.trim().is_empty() {
                return Err(Error::configuration(format!(
                    "case '{}' has an empty input",
                    case.id
                )));
            }
        }
        Ok(())
    }

    /// Cases surviving the tag include/exclude filters.
    pub fn filtered_cases(&self, include: &[String], exclude: &[String]) -> Vec<&TestCase> {
        self.test_cases
            .iter()
            .filter(|case| {
                let included =
                    include.is_empty() || case.tags.iter().any(|tag| include.contains(tag));
                let excluded = case.tags.iter().any(|tag| exclude.contains(tag));
                included && !excluded
            })
            .collect()
    }
}

/// Per-case measurements.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaseMetrics {
    pub duration_ms: u64,
    pub usage: Usage,
}

/// The outcome of one case.
#[derive(Debug, Clone, Serialize)]
pub struct CaseResult {
    pub id: String,
    pub name: Option<String>,
    pub passed: bool,
    /// Evaluator score in [0, 1].
    pub score: f64,
    pub actual: Value,
    pub expected: Value,
    pub metrics: CaseMetrics,
    /// Evaluator explanation, when it gave one.
    pub reason: Option<String>,
    /// Run failure (error code and message), when the case never produced
    /// an output. `"timeout"` for per-case timeouts.
    pub error: Option<String>,
}

/// Per-model pricing, per million tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPrice {
    pub fn cost(&self, usage: &Usage) -> f64 {
        usage.input_tokens as f64 / 1_000_000.0 * self.input_per_million
            + usage.output_tokens as f64 / 1_000_000.0 * self.output_per_million
    }
}

/// Aggregated suite outcome.
#[derive(Debug, Clone, Serialize)]
pub struct SuiteResult {
    pub suite_name: String,
    /// Per-case results, sorted by case id.
    pub results: Vec<CaseResult>,
    pub passed_count: usize,
    pub failed_count: usize,
    /// Fraction of cases that passed.
    pub pass_rate: f64,
    pub mean_score: f64,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
    pub latency_p99_ms: u64,
    /// Token totals summed across cases.
    pub usage: Usage,
    /// Total cost from the price table, when one was supplied.
    pub cost: Option<f64>,
    /// Wall-clock duration of the whole suite run.
    pub duration_ms: u64,
}

impl SuiteResult {
    /// Aggregates case results. Pass rate, averages, and percentiles are
    /// permutation-invariant; the report order is stable by case id.
    pub fn from_results(
        suite_name: impl Into<String>,
        mut results: Vec<CaseResult>,
        duration_ms: u64,
        cost: Option<f64>,
    ) -> SuiteResult {
        results.sort_by(|a, b| a.id.cmp(&b.id));

        let total = results.len();
        let passed_count = results.iter().filter(|r| r.passed).count();
        let mean_score = if total == 0 {
            0.0
        } else {
            results.iter().map(|r| r.score).sum::<f64>() / total as f64
        };

        let mut latencies: Vec<u64> = results.iter().map(|r| r.metrics.duration_ms).collect();
        latencies.sort_unstable();

        let mut usage = Usage::new();
        for result in &results {
            usage.add(&result.metrics.usage);
        }

        SuiteResult {
            suite_name: suite_name.into(),
            passed_count,
            failed_count: total - passed_count,
            pass_rate: if total == 0 {
                0.0
            } else {
                passed_count as f64 / total as f64
            },
            mean_score,
            latency_p50_ms: percentile(&latencies, 0.50),
            latency_p95_ms: percentile(&latencies, 0.95),
            latency_p99_ms: percentile(&latencies, 0.99),
            usage,
            cost,
            duration_ms,
            results,
        }
    }
}

/// Nearest-rank percentile over sorted values.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// A price table keyed by model spec (`"provider:model"`).
pub type PriceTable = HashMap<String, ModelPrice>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SUITE_YAML: &str = r#"
name: arithmetic
description: basic math
default_model: "openai:gpt-4o-mini"
default_timeout: 5000
parallelism: 2
test_cases:
  - id: add
    input: "What is 2+3?"
    expected: "5"
    eval_type: exact_match
    tags: [math, fast]
  - id: capital
    input: "Capital of France?"
    expected: "Paris"
    eval_type: contains
    tags: [geo]
    timeout: 1000
"#;

    fn result(id: &str, passed: bool, score: f64, duration_ms: u64) -> CaseResult {
        CaseResult {
            id: id.to_string(),
            name: None,
            passed,
            score,
            actual: json!(null),
            expected: json!(null),
            metrics: CaseMetrics {
                duration_ms,
                usage: {
                    let mut u = Usage::new();
                    u.add_tokens(100, 10);
                    u
                },
            },
            reason: None,
            error: None,
        }
    }

    #[test]
    fn test_suite_parses_from_yaml() {
        let suite = Suite::from_yaml_str(SUITE_YAML).unwrap();
        assert_eq!(suite.name, "arithmetic");
        assert_eq!(suite.parallelism, Some(2));
        assert_eq!(suite.default_timeout_ms, Some(5000));
        assert_eq!(suite.test_cases.len(), 2);
        assert_eq!(suite.test_cases[0].eval_type, EvalType::ExactMatch);
        assert_eq!(suite.test_cases[1].timeout_ms, Some(1000));
    }

    #[test]
    fn test_suite_validation() {
        assert!(Suite::from_yaml_str("name: empty\ntest_cases: []").is_err());

        let duplicate = r#"
name: dup
test_cases:
  - {id: a, input: "x", eval_type: exact_match}
  - {id: a, input: "y", eval_type: exact_match}
"#;
        let err = Suite::from_yaml_str(duplicate).unwrap_err();
        assert!(err.to_string().contains("duplicate case id"));
    }

    #[test]
    fn test_tag_filters() {
        let suite = Suite::from_yaml_str(SUITE_YAML).unwrap();

        let math = suite.filtered_cases(&["math".to_string()], &[]);
        assert_eq!(math.len(), 1);
        assert_eq!(math[0].id, "add");

        let no_geo = suite.filtered_cases(&[], &["geo".to_string()]);
        assert_eq!(no_geo.len(), 1);
        assert_eq!(no_geo[0].id, "add");

        let all = suite.filtered_cases(&[], &[]);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_aggregation_permutation_invariant() {
        let results = vec![
            result("a", true, 1.0, 100),
            result("b", false, 0.2, 300),
            result("c", true, 0.9, 200),
        ];
        let mut permuted = results.clone();
        permuted.reverse();

        let first = SuiteResult::from_results("s", results, 1000, None);
        let second = SuiteResult::from_results("s", permuted, 1000, None);

        assert_eq!(first.pass_rate, second.pass_rate);
        assert_eq!(first.mean_score, second.mean_score);
        assert_eq!(first.latency_p50_ms, second.latency_p50_ms);
        assert_eq!(first.latency_p99_ms, second.latency_p99_ms);
        // Report order is stable by id either way
        let ids: Vec<_> = second.results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_aggregate_numbers() {
        let results = vec![
            result("a", true, 1.0, 100),
            result("b", true, 0.8, 200),
            result("c", false, 0.0, 400),
            result("d", true, 1.0, 300),
        ];
        let aggregated = SuiteResult::from_results("s", results, 1500, None);
        assert_eq!(aggregated.passed_count, 3);
        assert_eq!(aggregated.failed_count, 1);
        assert!((aggregated.pass_rate - 0.75).abs() < 1e-9);
        assert!((aggregated.mean_score - 0.7).abs() < 1e-9);
        assert_eq!(aggregated.latency_p50_ms, 200);
        assert_eq!(aggregated.latency_p99_ms, 400);
        assert_eq!(aggregated.usage.input_tokens, 400);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let values = vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100];
        assert_eq!(percentile(&values, 0.50), 50);
        assert_eq!(percentile(&values, 0.95), 100);
        assert_eq!(percentile(&values, 0.99), 100);
        assert_eq!(percentile(&[], 0.5), 0);
        assert_eq!(percentile(&[42], 0.99), 42);
    }

    #[test]
    fn test_model_price() {
        let price = ModelPrice {
            input_per_million: 2.0,
            output_per_million: 10.0,
        };
        let mut usage = Usage::new();
        usage.add_tokens(1_000_000, 100_000);
        assert!((price.cost(&usage) - 3.0).abs() < 1e-9);
    }
}
