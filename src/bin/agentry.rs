//! Command-line entry point: evaluation suites and parameter optimization.
//!
//! ```text
//! agentry eval --suite cases.yaml --model openai:gpt-4o-mini
//! agentry eval --dir test/eval/suites --tags fast --format json
//! agentry optimize --suite cases.yaml --strategy bayesian --trials 30
//! ```
//!
//! `eval` exits 0 only when every suite has a pass rate of 1.0.

use agentry::eval::{self, EvalOptions, Suite, SuiteResult};
use agentry::optimize::{self, OptimizeOptions, SearchSpace, SuiteObjective};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "agentry",
    version,
    about = "Run evaluation suites and optimize agent parameters"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one or more evaluation suites
    Eval(EvalArgs),
    /// Search agent parameters against a suite
    Optimize(OptimizeArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    Console,
    Json,
    Markdown,
}

#[derive(clap::Args)]
struct EvalArgs {
    /// Run a single suite file
    #[arg(long)]
    suite: Option<PathBuf>,

    /// Load every .yaml/.yml suite in this directory
    #[arg(long, default_value = "test/eval/suites")]
    dir: PathBuf,

    /// Only run cases carrying one of these tags (comma separated)
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,

    /// Skip cases carrying one of these tags (comma separated)
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,

    /// Override the suite's default model ("provider:model")
    #[arg(long)]
    model: Option<String>,

    /// Concurrent case bound
    #[arg(long)]
    parallel: Option<usize>,

    /// Per-case timeout in milliseconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Re-run attempts for cases whose run errored
    #[arg(long)]
    retry: Option<u32>,

    #[arg(long, value_enum, default_value_t = ReportFormat::Console)]
    format: ReportFormat,

    /// Write the report here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long, short)]
    verbose: bool,
}

#[derive(clap::Args)]
struct OptimizeArgs {
    /// The suite to optimize against
    #[arg(long)]
    suite: PathBuf,

    /// grid_search, random, or bayesian
    #[arg(long, default_value = "bayesian")]
    strategy: String,

    /// Trial budget
    #[arg(long)]
    trials: Option<usize>,

    /// score | pass_rate | latency_p50 | latency_p95 | latency_p99 |
    /// total_tokens | cost
    #[arg(long, default_value = "score")]
    metric: String,

    /// Minimize the metric instead of maximizing
    #[arg(long)]
    minimize: bool,

    /// Overall search deadline in milliseconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Stop once a trial's score meets this threshold
    #[arg(long)]
    early_stop: Option<f64>,

    /// YAML file defining the search space
    #[arg(long)]
    params: Option<PathBuf>,

    /// Write the result JSON here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long, short)]
    verbose: bool,

    #[arg(long, short)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Eval(args) => run_eval(args).await,
        Command::Optimize(args) => run_optimize(args).await,
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
    agentry::telemetry::attach_default_logger();
}

async fn run_eval(args: EvalArgs) -> anyhow::Result<()> {
    init_logging(args.verbose);

    let suites: Vec<Suite> = match &args.suite {
        Some(path) => vec![Suite::from_path(path)
            .with_context(|| format!("loading suite {}", path.display()))?],
        None => {
            let suites = Suite::load_dir(&args.dir)
                .with_context(|| format!("loading suites from {}", args.dir.display()))?;
            if suites.is_empty() {
                bail!("no suite files found in {}", args.dir.display());
            }
            suites
        }
    };

    let options = EvalOptions {
        tags: args.tags.clone(),
        exclude_tags: args.exclude.clone(),
        model_override: args.model.clone(),
        parallelism: args.parallel,
        timeout_ms: args.timeout,
        retry_failed: args.retry,
        ..EvalOptions::default()
    };

    let mut results = Vec::with_capacity(suites.len());
    for suite in &suites {
        log::info!("running suite '{}'", suite.name);
        let result = eval::run_suite(suite, &options)
            .await
            .with_context(|| format!("running suite '{}'", suite.name))?;
        results.push(result);
    }

    let report = match args.format {
        ReportFormat::Console => render_console(&results),
        ReportFormat::Json => serde_json::to_string_pretty(&results)?,
        ReportFormat::Markdown => render_markdown(&results),
    };
    write_report(&args.output, &report)?;

    let all_passed = results.iter().all(|r| (r.pass_rate - 1.0).abs() < f64::EPSILON);
    if all_passed {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

async fn run_optimize(args: OptimizeArgs) -> anyhow::Result<()> {
    if !args.quiet {
        init_logging(args.verbose);
    }

    let suite = Suite::from_path(&args.suite)
        .with_context(|| format!("loading suite {}", args.suite.display()))?;

    let space = match &args.params {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading parameter file {}", path.display()))?;
            SearchSpace::from_yaml_str(&text)?
        }
        // Without a parameter file, search the temperature knob.
        None => SearchSpace::new(vec![optimize::Parameter::float("temperature", 0.0, 1.0)]),
    };

    let options = OptimizeOptions {
        strategy: args.strategy.parse()?,
        n_trials: args.trials,
        metric: args.metric.parse()?,
        minimize: args.minimize,
        early_stop: args.early_stop,
        timeout: args.timeout.map(Duration::from_millis),
        ..OptimizeOptions::default()
    };

    let objective = Arc::new(SuiteObjective::new(suite, EvalOptions::default()));
    let result = optimize::optimize(&space, objective, &options).await?;

    if !args.quiet {
        log::info!(
            "best score {:.4} after {} trial(s) in {} ms",
            result.best.score,
            result.trials.len(),
            result.duration_ms
        );
    }

    let report = serde_json::to_string_pretty(&result)?;
    write_report(&args.output, &report)?;
    Ok(())
}

fn write_report(output: &Option<PathBuf>, report: &str) -> anyhow::Result<()> {
    match output {
        Some(path) => std::fs::write(path, report)
            .with_context(|| format!("writing report to {}", path.display()))?,
        None => println!("{}", report),
    }
    Ok(())
}

fn render_console(results: &[SuiteResult]) -> String {
    let mut out = String::new();
    for result in results {
        out.push_str(&format!(
            "suite '{}': {}/{} passed ({:.1}%), mean score {:.3}, p50 {} ms, p95 {} ms, p99 {} ms, {} tokens\n",
            result.suite_name,
            result.passed_count,
            result.results.len(),
            result.pass_rate * 100.0,
            result.mean_score,
            result.latency_p50_ms,
            result.latency_p95_ms,
            result.latency_p99_ms,
            result.usage.total_tokens,
        ));
        if let Some(cost) = result.cost {
            out.push_str(&format!("  cost: ${:.4}\n", cost));
        }
        for case in result.results.iter().filter(|c| !c.passed) {
            let why = case
                .error
                .clone()
                .or_else(|| case.reason.clone())
                .unwrap_or_else(|| "failed".to_string());
            out.push_str(&format!("  FAIL {} ({})\n", case.id, why));
        }
    }
    out
}

fn render_markdown(results: &[SuiteResult]) -> String {
    let mut out = String::from(
        "| Suite | Passed | Pass rate | Mean score | p50 (ms) | p95 (ms) | p99 (ms) | Tokens |\n\
         |---|---|---|---|---|---|---|---|\n",
    );
    for result in results {
        out.push_str(&format!(
            "| {} | {}/{} | {:.1}% | {:.3} | {} | {} | {} | {} |\n",
            result.suite_name,
            result.passed_count,
            result.results.len(),
            result.pass_rate * 100.0,
            result.mean_score,
            result.latency_p50_ms,
            result.latency_p95_ms,
            result.latency_p99_ms,
            result.usage.total_tokens,
        ));
    }
    for result in results {
        let failed: Vec<_> = result.results.iter().filter(|c| !c.passed).collect();
        if !failed.is_empty() {
            out.push_str(&format!("\n### Failures in {}\n\n", result.suite_name));
            for case in failed {
                let why = case
                    .error
                    .clone()
                    .or_else(|| case.reason.clone())
                    .unwrap_or_else(|| "failed".to_string());
                out.push_str(&format!("- `{}`: {}\n", case.id, why));
            }
        }
    }
    out
}
