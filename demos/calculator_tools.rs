//! Tool-calling agent against any configured provider.
//!
//! ```sh
//! OPENAI_API_KEY=... cargo run --example calculator_tools
//! ```

use agentry::{tool, Agent, Model, RunOptions};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let add = tool("add", "Add two numbers")
        .param("a", "number")
        .param("b", "number")
        .build(|_ctx, args| async move {
            let a = args["a"].as_f64().unwrap_or(0.0);
            let b = args["b"].as_f64().unwrap_or(0.0);
            Ok(json!({"result": a + b}))
        });

    let multiply = tool("multiply", "Multiply two numbers")
        .param("a", "number")
        .param("b", "number")
        .build(|_ctx, args| async move {
            let a = args["a"].as_f64().unwrap_or(0.0);
            let b = args["b"].as_f64().unwrap_or(0.0);
            Ok(json!({"result": a * b}))
        });

    let agent = Agent::builder()
        .name("calculator")
        .model(Model::parse("openai:gpt-4o-mini")?)
        .instructions("You are a precise calculator. Always use the tools for arithmetic.")
        .tool(add)
        .tool(multiply)
        .build()?;

    let result = agentry::run(
        &agent,
        "What is (17 + 25) * 3? Work it out step by step.",
        RunOptions::default(),
    )
    .await?;

    println!("answer: {}", result.output_text());
    println!(
        "requests: {}, tool calls: {}, tokens: {}",
        result.usage.requests, result.usage.tool_calls, result.usage.total_tokens
    );
    Ok(())
}
