//! Structured output end to end: candidate extraction, validation, and
//! the feedback-retry loop.

mod common;

use agentry::{Agent, Error, Model, OutputType, Role, RunOptions, STRUCTURED_OUTPUT_TOOL};
use common::{test_model, text_response, MockChatModel};
use serde_json::json;

fn classification_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "class": {"type": "string"},
            "reason": {"type": "string"},
            "score": {"type": "number", "minimum": 0.0, "maximum": 1.0},
        },
        "required": ["class", "reason", "score"],
    })
}

fn classifier(output_retries: u32) -> Agent {
    Agent::builder()
        .name("classifier")
        .model(test_model())
        .instructions("Classify the message.")
        .output_type(OutputType::Schema(classification_schema()))
        .output_retries(output_retries)
        .build()
        .unwrap()
}

#[tokio::test]
async fn valid_output_is_returned_as_json() {
    let client = MockChatModel::scripted(vec![text_response(
        "{\"class\": \"spam\", \"reason\": \"pushy link\", \"score\": 0.93}",
    )]);

    let result = agentry::run_with_client(
        &classifier(1),
        "BUY NOW!!!",
        RunOptions::default(),
        client,
    )
    .await
    .unwrap();

    assert_eq!(result.output["class"], "spam");
    assert_eq!(result.output["score"], 0.93);
}

#[tokio::test]
async fn validation_failure_feeds_errors_back_and_retries() {
    let client = MockChatModel::scripted(vec![
        // score out of range on the first attempt
        text_response("{\"class\": \"spam\", \"reason\": \"x\", \"score\": 1.5}"),
        text_response("{\"class\": \"spam\", \"reason\": \"x\", \"score\": 0.9}"),
    ]);

    let result = agentry::run_with_client(
        &classifier(1),
        "BUY NOW!!!",
        RunOptions::default(),
        client.clone(),
    )
    .await
    .unwrap();

    assert_eq!(result.output["score"], 0.9);
    assert_eq!(client.request_count(), 2);

    // The follow-up request carried a field-level correction
    let retry_request = client.request(1);
    let feedback = retry_request
        .iter()
        .filter(|m| matches!(m.role, Role::User))
        .last()
        .unwrap()
        .text();
    assert!(feedback.contains("/score"), "feedback was: {}", feedback);
    assert!(feedback.contains("did not match the required schema"));
}

#[tokio::test]
async fn validation_exhaustion_returns_field_errors() {
    let client = MockChatModel::scripted(vec![text_response(
        "{\"class\": \"spam\", \"reason\": \"x\", \"score\": 1.5}",
    )]);

    let err = agentry::run_with_client(
        &classifier(0),
        "BUY NOW!!!",
        RunOptions::default(),
        client,
    )
    .await
    .unwrap_err();

    assert_eq!(err.code(), "validation_error");
    match err {
        Error::Validation { errors, .. } => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].path, "/score");
        }
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[tokio::test]
async fn markdown_fenced_output_is_extracted() {
    // Gemini selects md_json automatically
    let agent = Agent::builder()
        .model(
            Model::builder("gemini:gemini-2.0-flash")
                .unwrap()
                .api_key("test")
                .build()
                .unwrap(),
        )
        .output_type(OutputType::Schema(classification_schema()))
        .build()
        .unwrap();

    let client = MockChatModel::scripted(vec![text_response(
        "Here is the classification:\n```json\n{\"class\": \"ham\", \"reason\": \"newsletter\", \"score\": 0.1}\n```",
    )]);

    let result = agentry::run_with_client(&agent, "weekly digest", RunOptions::default(), client)
        .await
        .unwrap();
    assert_eq!(result.output["class"], "ham");
}

#[tokio::test]
async fn tool_call_mode_takes_output_from_the_forced_call() {
    // Anthropic selects tool_call automatically
    let agent = Agent::builder()
        .model(
            Model::builder("anthropic:claude-sonnet-4-5")
                .unwrap()
                .api_key("sk-ant-test")
                .build()
                .unwrap(),
        )
        .output_type(OutputType::Schema(classification_schema()))
        .build()
        .unwrap();

    let client = MockChatModel::scripted(vec![common::tool_call_response(vec![(
        "toolu_1",
        STRUCTURED_OUTPUT_TOOL,
        json!({"class": "spam", "reason": "pushy", "score": 0.8}),
    )])]);

    let result = agentry::run_with_client(&agent, "BUY NOW", RunOptions::default(), client.clone())
        .await
        .unwrap();

    assert_eq!(result.output["class"], "spam");
    // One request: the forced call is the output, not a tool to execute
    assert_eq!(client.request_count(), 1);
}
