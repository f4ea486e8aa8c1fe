//! Eval-runner tests: suites against a scripted model, aggregation, and
//! A/B comparison.

mod common;

use agentry::eval::{self, EvalHooks, EvalOptions, ModelPrice, Suite, Winner};
use common::{text_response, MockChatModel};
use serde_json::json;
use std::sync::Arc;

const ARITHMETIC_SUITE: &str = r#"
name: arithmetic
default_model: "openai:gpt-4o-mini"
test_cases:
  - id: add
    input: "What is 2+3? Answer with just the number."
    expected: "5"
    eval_type: exact_match
    tags: [math]
  - id: multiply
    input: "What is 6*7? Answer with just the number."
    expected: "42"
    eval_type: exact_match
    tags: [math]
  - id: capital
    input: "What is the capital of France?"
    expected: "Paris"
    eval_type: contains
    tags: [geo]
"#;

fn options_with(client: Arc<MockChatModel>) -> EvalOptions {
    EvalOptions {
        client: Some(client),
        ..EvalOptions::default()
    }
}

#[tokio::test]
async fn suite_runs_and_aggregates() {
    let suite = Suite::from_yaml_str(ARITHMETIC_SUITE).unwrap();
    // Sequential execution consumes the script in case order
    let client = MockChatModel::scripted(vec![
        text_response("5"),
        text_response("41"),
        text_response("The capital of France is Paris."),
    ]);

    let result = eval::run_suite(&suite, &options_with(client)).await.unwrap();

    assert_eq!(result.results.len(), 3);
    assert_eq!(result.passed_count, 2);
    assert!((result.pass_rate - 2.0 / 3.0).abs() < 1e-9);

    // Stable report order by case id
    let ids: Vec<_> = result.results.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["add", "capital", "multiply"]);

    let failed = result.results.iter().find(|r| r.id == "multiply").unwrap();
    assert!(!failed.passed);
    assert_eq!(failed.actual, json!("41"));
    assert!(failed.error.is_none());

    // Token totals summed across the three runs (15 tokens each)
    assert_eq!(result.usage.total_tokens, 45);
}

#[tokio::test]
async fn tag_filters_select_cases() {
    let suite = Suite::from_yaml_str(ARITHMETIC_SUITE).unwrap();
    let client = MockChatModel::always(text_response("5"));

    let options = EvalOptions {
        tags: vec!["math".to_string()],
        ..options_with(client)
    };
    let result = eval::run_suite(&suite, &options).await.unwrap();
    assert_eq!(result.results.len(), 2);

    let client = MockChatModel::always(text_response("whatever"));
    let options = EvalOptions {
        exclude_tags: vec!["math".to_string()],
        ..options_with(client)
    };
    let result = eval::run_suite(&suite, &options).await.unwrap();
    assert_eq!(result.results.len(), 1);
    assert_eq!(result.results[0].id, "capital");
}

#[tokio::test]
async fn run_errors_are_case_local() {
    let suite = Suite::from_yaml_str(ARITHMETIC_SUITE).unwrap();
    // Script covers only the first case; the rest error out
    let client = MockChatModel::scripted(vec![text_response("5")]);

    let result = eval::run_suite(&suite, &options_with(client)).await.unwrap();

    let add = result.results.iter().find(|r| r.id == "add").unwrap();
    assert!(add.passed);

    let errored: Vec<_> = result.results.iter().filter(|r| r.error.is_some()).collect();
    assert_eq!(errored.len(), 2);
    assert!(errored.iter().all(|r| r.score == 0.0));
    // The suite still aggregated instead of aborting
    assert!((result.pass_rate - 1.0 / 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn per_case_timeout_records_timeout() {
    const SLOW_SUITE: &str = r#"
name: slow
default_model: "openai:gpt-4o-mini"
test_cases:
  - id: never-finishes
    input: "hang"
    expected: "x"
    eval_type: exact_match
    timeout: 20
"#;
    let suite = Suite::from_yaml_str(SLOW_SUITE).unwrap();

    // A model that never answers: empty script means an error, so wrap
    // with a custom slow client instead.
    struct SlowModel;
    #[async_trait::async_trait]
    impl agentry::ChatModel for SlowModel {
        async fn request(
            &self,
            _model: &agentry::Model,
            _messages: &[agentry::Message],
            _tools: &[agentry::ToolDef],
            _settings: &agentry::ModelSettings,
        ) -> agentry::Result<agentry::ChatResponse> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Err(agentry::Error::stream("unreachable"))
        }
        async fn request_stream(
            &self,
            _model: &agentry::Model,
            _messages: &[agentry::Message],
            _tools: &[agentry::ToolDef],
            _settings: &agentry::ModelSettings,
        ) -> agentry::Result<agentry::EventStream> {
            Err(agentry::Error::stream("unsupported"))
        }
    }

    let options = EvalOptions {
        client: Some(Arc::new(SlowModel)),
        ..EvalOptions::default()
    };
    let result = eval::run_suite(&suite, &options).await.unwrap();
    assert_eq!(result.results[0].error.as_deref(), Some("timeout"));
    assert!(!result.results[0].passed);
}

#[tokio::test]
async fn retry_failed_reruns_erroring_cases() {
    const SINGLE_SUITE: &str = r#"
name: single
default_model: "openai:gpt-4o-mini"
retry_failed: 1
test_cases:
  - id: flaky
    input: "answer"
    expected: "ok"
    eval_type: exact_match
"#;
    let suite = Suite::from_yaml_str(SINGLE_SUITE).unwrap();
    // Fails the first request with a non-retryable error, so the run
    // itself fails and only the eval-level retry can rescue the case.
    struct FailOnce {
        inner: Arc<MockChatModel>,
        failed: std::sync::atomic::AtomicBool,
    }
    #[async_trait::async_trait]
    impl agentry::ChatModel for FailOnce {
        async fn request(
            &self,
            model: &agentry::Model,
            messages: &[agentry::Message],
            tools: &[agentry::ToolDef],
            settings: &agentry::ModelSettings,
        ) -> agentry::Result<agentry::ChatResponse> {
            if !self.failed.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(agentry::Error::provider(
                    "openai",
                    agentry::ProviderErrorKind::BadRequest,
                    Some(400),
                    "first attempt breaks",
                ));
            }
            agentry::ChatModel::request(&*self.inner, model, messages, tools, settings).await
        }
        async fn request_stream(
            &self,
            _model: &agentry::Model,
            _messages: &[agentry::Message],
            _tools: &[agentry::ToolDef],
            _settings: &agentry::ModelSettings,
        ) -> agentry::Result<agentry::EventStream> {
            Err(agentry::Error::stream("unsupported"))
        }
    }

    let options = EvalOptions {
        client: Some(Arc::new(FailOnce {
            inner: MockChatModel::always(text_response("ok")),
            failed: std::sync::atomic::AtomicBool::new(false),
        })),
        ..EvalOptions::default()
    };

    let result = eval::run_suite(&suite, &options).await.unwrap();
    assert!(result.results[0].passed, "retry should have rescued the case");
}

#[tokio::test]
async fn cost_is_computed_from_the_price_table() {
    let suite = Suite::from_yaml_str(ARITHMETIC_SUITE).unwrap();
    let client = MockChatModel::always(text_response("5"));

    let mut options = options_with(client);
    options.prices.insert(
        "openai:gpt-4o-mini".to_string(),
        ModelPrice {
            input_per_million: 1.0,
            output_per_million: 10.0,
        },
    );

    let result = eval::run_suite(&suite, &options).await.unwrap();
    // 3 cases x (10 input + 5 output tokens)
    let expected = 30.0 / 1e6 * 1.0 + 15.0 / 1e6 * 10.0;
    assert!((result.cost.unwrap() - expected).abs() < 1e-12);
}

#[tokio::test]
async fn llm_judge_uses_the_injected_judge_client() {
    const JUDGED_SUITE: &str = r#"
name: judged
default_model: "openai:gpt-4o-mini"
test_cases:
  - id: summary
    input: "Summarize: the sky is blue because of Rayleigh scattering."
    expected: ~
    eval_type: llm_judge
    eval_config:
      criteria: "Mentions Rayleigh scattering"
      min_score: 0.6
"#;
    let suite = Suite::from_yaml_str(JUDGED_SUITE).unwrap();

    let agent_client = MockChatModel::always(text_response(
        "Blue light scatters more (Rayleigh scattering).",
    ));
    let judge_client = MockChatModel::always(text_response(
        "{\"score\": 0.85, \"reasoning\": \"mentions the mechanism\"}",
    ));

    let options = EvalOptions {
        client: Some(agent_client),
        hooks: EvalHooks {
            custom: None,
            judge_client: Some(judge_client),
        },
        ..EvalOptions::default()
    };

    let result = eval::run_suite(&suite, &options).await.unwrap();
    assert!(result.results[0].passed);
    assert!((result.results[0].score - 0.85).abs() < 1e-9);
}

#[tokio::test]
async fn ab_comparison_declares_a_winner() {
    let suite = Suite::from_yaml_str(ARITHMETIC_SUITE).unwrap();

    // Configuration A answers everything, B answers nothing correctly
    let good = MockChatModel::scripted(vec![
        text_response("5"),
        text_response("42"),
        text_response("Paris"),
    ]);
    let bad = MockChatModel::always(text_response("no idea"));

    let comparison = eval::compare_suites(&suite, &options_with(good), &options_with(bad))
        .await
        .unwrap();
    assert_eq!(comparison.winner, Winner::A);

    // Identical configurations tie
    let same_a = MockChatModel::always(text_response("no idea"));
    let same_b = MockChatModel::always(text_response("no idea"));
    let comparison = eval::compare_suites(&suite, &options_with(same_a), &options_with(same_b))
        .await
        .unwrap();
    assert_eq!(comparison.winner, Winner::Tie);
}
