//! Search strategies: grid, random (with LHS), and TPE-inspired Bayesian.
//!
//! All strategies funnel trials through the same executor, which honors
//! early stopping, the overall deadline, and bounded parallelism. A trial
//! whose objective errors records score 0 and the search continues; only
//! infrastructure failures (none today) would abort a search.

use super::space::{ParamKind, Parameter, SearchSpace, TrialConfig};
use super::{Metric, Objective, Trial, TrialMetrics};
use futures::stream::{self, StreamExt};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

/// Shared knobs the strategies receive from the optimizer entry point.
#[derive(Clone)]
pub(super) struct SearchContext {
    pub objective: Arc<dyn Objective>,
    pub metric: Metric,
    pub minimize: bool,
    pub early_stop: Option<f64>,
    pub deadline: Option<Instant>,
    pub parallelism: usize,
}

impl SearchContext {
    fn deadline_passed(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    /// Whether a score meets the early-stop threshold.
    fn stop_reached(&self, score: f64) -> bool {
        match self.early_stop {
            Some(threshold) if self.minimize => score <= threshold,
            Some(threshold) => score >= threshold,
            None => false,
        }
    }
}

/// Runs one configuration through the objective.
pub(super) async fn run_trial(ctx: &SearchContext, config: TrialConfig) -> Trial {
    let started = Instant::now();
    match ctx.objective.measure(&config).await {
        Ok(metrics) => Trial {
            score: ctx.metric.extract(&metrics),
            metrics,
            config,
            duration_ms: started.elapsed().as_millis() as u64,
            error: None,
        },
        Err(err) => Trial {
            score: 0.0,
            metrics: TrialMetrics::default(),
            config,
            duration_ms: started.elapsed().as_millis() as u64,
            error: Some(err.to_string()),
        },
    }
}

/// Runs a batch of configurations with bounded parallelism, accumulating
/// results on this coordinator task. Stops consuming once the early-stop
/// threshold or the deadline is hit.
pub(super) async fn run_batch(ctx: &SearchContext, configs: Vec<TrialConfig>) -> Vec<Trial> {
    let mut pending = stream::iter(configs)
        .map(|config| run_trial(ctx, config))
        .buffer_unordered(ctx.parallelism.max(1));

    let mut trials = Vec::new();
    while let Some(trial) = pending.next().await {
        let stop = ctx.stop_reached(trial.score);
        trials.push(trial);
        if stop || ctx.deadline_passed() {
            break;
        }
    }
    trials
}

/// Exhaustive enumeration of the grid, optionally shuffled and capped.
pub(super) async fn grid_search(
    space: &SearchSpace,
    ctx: &SearchContext,
    shuffle: bool,
    max_trials: Option<usize>,
) -> Vec<Trial> {
    let mut configs = space.grid_configs();
    if shuffle {
        configs.shuffle(&mut rand::thread_rng());
    }
    if let Some(max) = max_trials {
        configs.truncate(max);
    }
    run_batch(ctx, configs).await
}

/// Independent random draws, or stratified LHS draws for better coverage.
pub(super) async fn random_search(
    space: &SearchSpace,
    ctx: &SearchContext,
    n_trials: usize,
    latin_hypercube: bool,
) -> Vec<Trial> {
    let configs = {
        let mut rng = rand::thread_rng();
        if latin_hypercube {
            space.lhs_samples(n_trials, &mut rng)
        } else {
            (0..n_trials).map(|_| space.sample(&mut rng)).collect()
        }
    };
    run_batch(ctx, configs).await
}

/// TPE-inspired Bayesian search.
///
/// Phase 1 seeds with LHS samples. Phase 2 proposes sequentially: prior
/// trials split into a good set (top γ quantile by score) and a bad set;
/// each parameter samples near a good value with probability 0.7
/// (jittered within ±20% of the range for numeric kinds, most-frequent
/// for categorical), otherwise away from the bad region.
pub(super) async fn bayesian(
    space: &SearchSpace,
    ctx: &SearchContext,
    n_trials: usize,
    n_initial: Option<usize>,
    gamma: f64,
) -> Vec<Trial> {
    let n_initial = n_initial.unwrap_or(10).min(n_trials).max(1);

    let initial = {
        let mut rng = rand::thread_rng();
        space.lhs_samples(n_initial, &mut rng)
    };
    let mut trials = run_batch(ctx, initial).await;

    while trials.len() < n_trials {
        if ctx.deadline_passed() || trials.iter().any(|t| ctx.stop_reached(t.score)) {
            break;
        }
        let config = {
            let mut rng = rand::thread_rng();
            propose(space, &trials, gamma, ctx.minimize, &mut rng)
        };
        let trial = run_trial(ctx, config).await;
        trials.push(trial);
    }
    trials
}

/// Splits prior trials into (good, bad) by the γ quantile of their scores.
fn split_trials(trials: &[Trial], gamma: f64, minimize: bool) -> (Vec<&Trial>, Vec<&Trial>) {
    let mut sorted: Vec<&Trial> = trials.iter().collect();
    sorted.sort_by(|a, b| {
        let ordering = a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal);
        if minimize { ordering } else { ordering.reverse() }
    });
    let n_good = ((trials.len() as f64 * gamma).ceil() as usize).clamp(1, sorted.len());
    let bad = sorted.split_off(n_good);
    (sorted, bad)
}

fn values_for<'a>(trials: &[&'a Trial], name: &str) -> Vec<&'a Value> {
    trials
        .iter()
        .filter_map(|trial| trial.config.get(name))
        .collect()
}

fn most_frequent(values: &[&Value]) -> Option<Value> {
    let mut counts: Vec<(Value, usize)> = Vec::new();
    for value in values {
        match counts.iter_mut().find(|(v, _)| v == *value) {
            Some((_, count)) => *count += 1,
            None => counts.push(((*value).clone(), 1)),
        }
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(value, _)| value)
}

fn least_frequent_grid_value(parameter: &Parameter, bad: &[&Value]) -> Value {
    let candidates = parameter.grid_values();
    candidates
        .into_iter()
        .min_by_key(|candidate| bad.iter().filter(|v| **v == candidate).count())
        .unwrap_or(Value::Null)
}

/// Samples one parameter near a randomly chosen good value.
fn sample_near_good<R: Rng>(parameter: &Parameter, good: &[&Value], rng: &mut R) -> Value {
    match &parameter.kind {
        ParamKind::Float { min, max, .. } => {
            let anchor = good
                .choose(rng)
                .and_then(|v| v.as_f64())
                .unwrap_or((min + max) / 2.0);
            let jitter = (rng.gen::<f64>() - 0.5) * 0.4 * (max - min);
            Value::from((anchor + jitter).clamp(*min, *max))
        }
        ParamKind::Integer { min, max, .. } => {
            let anchor = good
                .choose(rng)
                .and_then(|v| v.as_i64())
                .unwrap_or((min + max) / 2);
            let range = (max - min).max(1) as f64;
            let jitter = ((rng.gen::<f64>() - 0.5) * 0.4 * range).round() as i64;
            Value::from((anchor + jitter).clamp(*min, *max))
        }
        ParamKind::Choice { .. } | ParamKind::Bool => most_frequent(good)
            .unwrap_or_else(|| parameter.sample(rng)),
    }
}

/// Samples one parameter away from the bad region: several uniform
/// candidates, keeping the one farthest from any bad value.
fn sample_away_from_bad<R: Rng>(parameter: &Parameter, bad: &[&Value], rng: &mut R) -> Value {
    match &parameter.kind {
        ParamKind::Float { min, max, .. } => {
            let range = (max - min).max(f64::MIN_POSITIVE);
            let bad_values: Vec<f64> = bad.iter().filter_map(|v| v.as_f64()).collect();
            if bad_values.is_empty() {
                return parameter.sample(rng);
            }
            (0..8)
                .map(|_| parameter.sample(rng))
                .max_by(|a, b| {
                    let distance = |value: &Value| {
                        let value = value.as_f64().unwrap_or(*min);
                        bad_values
                            .iter()
                            .map(|bad| ((value - bad) / range).abs())
                            .fold(f64::INFINITY, f64::min)
                    };
                    distance(a)
                        .partial_cmp(&distance(b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap_or_else(|| parameter.sample(rng))
        }
        ParamKind::Integer { min, max, .. } => {
            let range = (max - min).max(1) as f64;
            let bad_values: Vec<i64> = bad.iter().filter_map(|v| v.as_i64()).collect();
            if bad_values.is_empty() {
                return parameter.sample(rng);
            }
            (0..8)
                .map(|_| parameter.sample(rng))
                .max_by_key(|candidate| {
                    let value = candidate.as_i64().unwrap_or(*min);
                    bad_values
                        .iter()
                        .map(|bad| (((value - bad).abs() as f64 / range) * 1_000.0) as u64)
                        .min()
                        .unwrap_or(0)
                })
                .unwrap_or_else(|| parameter.sample(rng))
        }
        ParamKind::Choice { .. } | ParamKind::Bool => least_frequent_grid_value(parameter, bad),
    }
}

/// Proposes the next configuration from the trial history.
fn propose<R: Rng>(
    space: &SearchSpace,
    trials: &[Trial],
    gamma: f64,
    minimize: bool,
    rng: &mut R,
) -> TrialConfig {
    if trials.is_empty() {
        return space.sample(rng);
    }
    let (good, bad) = split_trials(trials, gamma, minimize);

    let mut config = TrialConfig::new();
    for parameter in &space.parameters {
        if !parameter.active(&config) {
            continue;
        }
        let good_values = values_for(&good, &parameter.name);
        let bad_values = values_for(&bad, &parameter.name);

        let value = if !good_values.is_empty() && rng.gen_bool(0.7) {
            sample_near_good(parameter, &good_values, rng)
        } else {
            sample_away_from_bad(parameter, &bad_values, rng)
        };
        config.insert(parameter.name.clone(), value);
    }
    config
}
