//! Parameter optimization over evaluation suites.
//!
//! The optimizer searches a [`SearchSpace`] for the configuration that
//! maximizes (or minimizes) a metric produced by an [`Objective`]. Three
//! strategies ship: exhaustive grid search, random search with optional
//! Latin-Hypercube stratification, and a TPE-inspired Bayesian search.
//!
//! The usual objective is [`SuiteObjective`], which applies each trial's
//! configuration onto an evaluation suite (model override, instructions
//! override, model settings merged into every case) and runs it through
//! the eval runner; any `Fn(TrialConfig) -> score` works for synthetic
//! searches and tests via [`FnObjective`].

pub mod space;
mod strategies;

pub use space::{Condition, ParamKind, Parameter, SearchSpace, TrialConfig};

use crate::error::{Error, Result};
use crate::eval::{runner as eval_runner, EvalOptions, Suite, SuiteResult};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The measurements one trial produces; the configured [`Metric`] picks
/// which one becomes the trial's score.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrialMetrics {
    pub score: f64,
    pub pass_rate: f64,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
    pub latency_p99_ms: u64,
    pub total_tokens: u64,
    pub cost: Option<f64>,
}

impl TrialMetrics {
    /// Metrics carrying only a synthetic score.
    pub fn from_score(score: f64) -> Self {
        Self {
            score,
            ..Default::default()
        }
    }

    pub fn from_suite(result: &SuiteResult) -> Self {
        Self {
            score: result.mean_score,
            pass_rate: result.pass_rate,
            latency_p50_ms: result.latency_p50_ms,
            latency_p95_ms: result.latency_p95_ms,
            latency_p99_ms: result.latency_p99_ms,
            total_tokens: result.usage.total_tokens,
            cost: result.cost,
        }
    }
}

/// Which measurement a search optimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Score,
    PassRate,
    LatencyP50,
    LatencyP95,
    LatencyP99,
    TotalTokens,
    Cost,
}

impl Metric {
    pub fn extract(&self, metrics: &TrialMetrics) -> f64 {
        match self {
            Metric::Score => metrics.score,
            Metric::PassRate => metrics.pass_rate,
            Metric::LatencyP50 => metrics.latency_p50_ms as f64,
            Metric::LatencyP95 => metrics.latency_p95_ms as f64,
            Metric::LatencyP99 => metrics.latency_p99_ms as f64,
            Metric::TotalTokens => metrics.total_tokens as f64,
            Metric::Cost => metrics.cost.unwrap_or(0.0),
        }
    }
}

impl FromStr for Metric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "score" => Ok(Metric::Score),
            "pass_rate" => Ok(Metric::PassRate),
            "latency_p50" => Ok(Metric::LatencyP50),
            "latency_p95" => Ok(Metric::LatencyP95),
            "latency_p99" => Ok(Metric::LatencyP99),
            "total_tokens" => Ok(Metric::TotalTokens),
            "cost" => Ok(Metric::Cost),
            other => Err(Error::configuration(format!("unknown metric '{}'", other))),
        }
    }
}

/// One evaluated configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Trial {
    pub config: TrialConfig,
    /// The configured metric's value (0 when the trial errored).
    pub score: f64,
    pub metrics: TrialMetrics,
    pub duration_ms: u64,
    /// Objective failure, recorded without aborting the search.
    pub error: Option<String>,
}

/// Search strategy selection.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    GridSearch {
        shuffle: bool,
    },
    Random {
        latin_hypercube: bool,
    },
    Bayesian {
        /// LHS seed trials; default `min(10, n_trials)`.
        n_initial: Option<usize>,
        /// Fraction of trials treated as "good" (default 0.25).
        gamma: f64,
    },
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Bayesian {
            n_initial: None,
            gamma: 0.25,
        }
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "grid_search" | "grid" => Ok(Strategy::GridSearch { shuffle: false }),
            "random" => Ok(Strategy::Random {
                latin_hypercube: true,
            }),
            "bayesian" => Ok(Strategy::default()),
            other => Err(Error::configuration(format!(
                "unknown strategy '{}' (expected grid_search, random, or bayesian)",
                other
            ))),
        }
    }
}

/// Options for one optimization run.
#[derive(Clone)]
pub struct OptimizeOptions {
    pub strategy: Strategy,
    /// Trial budget. Grid search defaults to the full grid; other
    /// strategies default to 20.
    pub n_trials: Option<usize>,
    pub metric: Metric,
    pub minimize: bool,
    /// Stop as soon as a trial's score meets this threshold.
    pub early_stop: Option<f64>,
    /// Overall search deadline.
    pub timeout: Option<Duration>,
    /// Concurrent trial bound (sequential by default; the Bayesian
    /// proposal phase is inherently sequential).
    pub parallelism: usize,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            n_trials: None,
            metric: Metric::Score,
            minimize: false,
            early_stop: None,
            timeout: None,
            parallelism: 1,
        }
    }
}

/// The search outcome: the winning trial plus the full history.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationResult {
    pub best: Trial,
    pub trials: Vec<Trial>,
    pub duration_ms: u64,
    pub mean_score: f64,
    pub std_dev: f64,
}

/// Anything that can score a configuration.
#[async_trait]
pub trait Objective: Send + Sync {
    async fn measure(&self, config: &TrialConfig) -> Result<TrialMetrics>;
}

/// Wraps a plain async scoring function as an objective.
pub struct FnObjective<F>(pub F);

#[async_trait]
impl<F, Fut> Objective for FnObjective<F>
where
    F: Fn(TrialConfig) -> Fut + Send + Sync,
    Fut: Future<Output = Result<f64>> + Send,
{
    async fn measure(&self, config: &TrialConfig) -> Result<TrialMetrics> {
        (self.0)(config.clone()).await.map(TrialMetrics::from_score)
    }
}

/// Scores a configuration by applying it to an eval suite and running it.
///
/// Recognized config keys: `model` (spec-string override),
/// `instructions`, and the model-settings knobs `temperature`,
/// `max_tokens`, `top_p`; everything else passes through as
/// provider-specific extra settings.
pub struct SuiteObjective {
    pub suite: Suite,
    pub options: EvalOptions,
}

impl SuiteObjective {
    pub fn new(suite: Suite, options: EvalOptions) -> Self {
        Self { suite, options }
    }

    fn apply(&self, config: &TrialConfig) -> EvalOptions {
        let mut options = self.options.clone();
        let mut settings = options.settings_override.clone().unwrap_or_default();

        for (key, value) in config {
            match key.as_str() {
                "model" => {
                    if let Some(spec) = value.as_str() {
                        options.model_override = Some(spec.to_string());
                    }
                }
                "instructions" => {
                    if let Some(text) = value.as_str() {
                        options.instructions_override = Some(text.to_string());
                    }
                }
                "temperature" => settings.temperature = value.as_f64(),
                "max_tokens" => settings.max_tokens = value.as_u64().map(|v| v as u32),
                "top_p" => settings.top_p = value.as_f64(),
                _ => {
                    settings.extra.insert(key.clone(), value.clone());
                }
            }
        }

        options.settings_override = Some(settings);
        options
    }
}

#[async_trait]
impl Objective for SuiteObjective {
    async fn measure(&self, config: &TrialConfig) -> Result<TrialMetrics> {
        let options = self.apply(config);
        let result = eval_runner::run_suite(&self.suite, &options).await?;
        Ok(TrialMetrics::from_suite(&result))
    }
}

/// Runs a search over the space with the configured strategy.
pub async fn optimize(
    space: &SearchSpace,
    objective: Arc<dyn Objective>,
    options: &OptimizeOptions,
) -> Result<OptimizationResult> {
    if space.parameters.is_empty() {
        return Err(Error::configuration("search space has no parameters"));
    }

    let started = Instant::now();
    let ctx = strategies::SearchContext {
        objective,
        metric: options.metric,
        minimize: options.minimize,
        early_stop: options.early_stop,
        deadline: options.timeout.map(|t| started + t),
        parallelism: options.parallelism,
    };

    let trials = match &options.strategy {
        Strategy::GridSearch { shuffle } => {
            strategies::grid_search(space, &ctx, *shuffle, options.n_trials).await
        }
        Strategy::Random { latin_hypercube } => {
            strategies::random_search(space, &ctx, options.n_trials.unwrap_or(20), *latin_hypercube)
                .await
        }
        Strategy::Bayesian { n_initial, gamma } => {
            strategies::bayesian(
                space,
                &ctx,
                options.n_trials.unwrap_or(20),
                *n_initial,
                *gamma,
            )
            .await
        }
    };

    if trials.is_empty() {
        return Err(Error::configuration("optimization produced no trials"));
    }

    let best = trials
        .iter()
        .min_by(|a, b| {
            let ordering = a
                .score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal);
            if options.minimize {
                ordering
            } else {
                ordering.reverse()
            }
        })
        .cloned()
        .expect("non-empty trials checked above");

    let scores: Vec<f64> = trials.iter().map(|t| t.score).collect();
    let mean_score = scores.iter().sum::<f64>() / scores.len() as f64;
    let variance = scores
        .iter()
        .map(|score| (score - mean_score).powi(2))
        .sum::<f64>()
        / scores.len() as f64;

    Ok(OptimizationResult {
        best,
        trials,
        duration_ms: started.elapsed().as_millis() as u64,
        mean_score,
        std_dev: variance.sqrt(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temperature_space() -> SearchSpace {
        SearchSpace::new(vec![Parameter::float("temperature", 0.0, 1.0)])
    }

    fn peak_objective() -> Arc<dyn Objective> {
        // Best score 1.0 at temperature 0.3
        Arc::new(FnObjective(|config: TrialConfig| async move {
            let temperature = config["temperature"].as_f64().unwrap_or(0.0);
            Ok::<_, Error>(1.0 - (temperature - 0.3).abs())
        }))
    }

    #[tokio::test]
    async fn test_grid_search_enumerates_full_grid() {
        let space = SearchSpace::new(vec![
            Parameter::integer("a", 0, 2),
            Parameter::bool("b"),
        ]);
        let result = optimize(
            &space,
            Arc::new(FnObjective(|config: TrialConfig| async move {
                Ok::<_, Error>(config["a"].as_i64().unwrap() as f64)
            })),
            &OptimizeOptions {
                strategy: Strategy::GridSearch { shuffle: false },
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(result.trials.len(), 6);
        assert_eq!(result.best.config["a"], json!(2));
    }

    #[tokio::test]
    async fn test_random_search_runs_requested_trials() {
        let result = optimize(
            &temperature_space(),
            peak_objective(),
            &OptimizeOptions {
                strategy: Strategy::Random {
                    latin_hypercube: true,
                },
                n_trials: Some(15),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(result.trials.len(), 15);
    }

    #[tokio::test]
    async fn test_bayesian_converges_on_the_peak() {
        let result = optimize(
            &temperature_space(),
            peak_objective(),
            &OptimizeOptions {
                strategy: Strategy::Bayesian {
                    n_initial: Some(10),
                    gamma: 0.25,
                },
                n_trials: Some(20),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(result.trials.len(), 20);
        // The LHS phase alone guarantees a sample within 0.1 of the peak
        assert!(result.best.score >= 0.9, "best {}", result.best.score);
        let best_temperature = result.best.config["temperature"].as_f64().unwrap();
        assert!((0.2..=0.4).contains(&best_temperature));
    }

    #[tokio::test]
    async fn test_minimize_flips_the_ordering() {
        let result = optimize(
            &temperature_space(),
            peak_objective(),
            &OptimizeOptions {
                strategy: Strategy::Random {
                    latin_hypercube: true,
                },
                n_trials: Some(20),
                minimize: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        // Minimizing the peaked function drives temperature toward 1.0
        // (score 0.3 at the far edge beats everything near the peak).
        assert!(result.best.score < 0.6);
    }

    #[tokio::test]
    async fn test_early_stop_halts_the_search() {
        let result = optimize(
            &temperature_space(),
            Arc::new(FnObjective(|_config: TrialConfig| async move { Ok::<_, Error>(1.0) })),
            &OptimizeOptions {
                strategy: Strategy::Random {
                    latin_hypercube: false,
                },
                n_trials: Some(50),
                early_stop: Some(0.99),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        // Every trial scores 1.0, so the very first one stops the search
        assert_eq!(result.trials.len(), 1);
    }

    #[tokio::test]
    async fn test_erroring_trials_score_zero_and_continue() {
        let result = optimize(
            &temperature_space(),
            Arc::new(FnObjective(|config: TrialConfig| async move {
                let temperature = config["temperature"].as_f64().unwrap_or(0.0);
                if temperature < 0.5 {
                    Err(Error::configuration("synthetic failure"))
                } else {
                    Ok::<_, Error>(temperature)
                }
            })),
            &OptimizeOptions {
                strategy: Strategy::Random {
                    latin_hypercube: true,
                },
                n_trials: Some(10),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(result.trials.len(), 10);
        let errored = result.trials.iter().filter(|t| t.error.is_some()).count();
        assert!(errored > 0);
        assert!(result
            .trials
            .iter()
            .filter(|t| t.error.is_some())
            .all(|t| t.score == 0.0));
        assert!(result.best.error.is_none());
    }

    #[tokio::test]
    async fn test_metric_parsing_and_extraction() {
        let metrics = TrialMetrics {
            score: 0.8,
            pass_rate: 0.75,
            latency_p50_ms: 120,
            latency_p95_ms: 300,
            latency_p99_ms: 450,
            total_tokens: 9000,
            cost: Some(0.02),
        };
        assert_eq!("pass_rate".parse::<Metric>().unwrap().extract(&metrics), 0.75);
        assert_eq!(
            "latency_p95".parse::<Metric>().unwrap().extract(&metrics),
            300.0
        );
        assert_eq!(
            "total_tokens".parse::<Metric>().unwrap().extract(&metrics),
            9000.0
        );
        assert!("nonsense".parse::<Metric>().is_err());
    }

    #[test]
    fn test_suite_objective_config_application() {
        let suite = Suite::from_yaml_str(
            "name: s\ntest_cases:\n  - {id: a, input: x, eval_type: exact_match}\n",
        )
        .unwrap();
        let objective = SuiteObjective::new(suite, EvalOptions::default());

        let mut config = TrialConfig::new();
        config.insert("model".to_string(), json!("openai:gpt-4o-mini"));
        config.insert("temperature".to_string(), json!(0.2));
        config.insert("safe_prompt".to_string(), json!(true));

        let applied = objective.apply(&config);
        assert_eq!(applied.model_override.as_deref(), Some("openai:gpt-4o-mini"));
        let settings = applied.settings_override.unwrap();
        assert_eq!(settings.temperature, Some(0.2));
        assert_eq!(settings.extra["safe_prompt"], json!(true));
    }
}
