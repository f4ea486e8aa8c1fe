//! ReAct agent: plan, track todos, act, then deliver a final answer.
//!
//! ```sh
//! ANTHROPIC_API_KEY=... cargo run --example react_research
//! ```

use agentry::{tool, Agent, BehaviourKind, Model, RunOptions};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    agentry::telemetry::attach_default_logger();

    // A stand-in knowledge base; swap in a real search tool.
    let lookup = tool("lookup", "Look up a fact in the knowledge base")
        .param("query", "string")
        .build(|_ctx, args| async move {
            let query = args["query"].as_str().unwrap_or("");
            Ok(json!({
                "query": query,
                "result": "Rayleigh scattering intensity scales with 1/wavelength^4.",
            }))
        });

    let agent = Agent::builder()
        .name("researcher")
        .model(Model::parse("anthropic:claude-sonnet-4-5")?)
        .behaviour(BehaviourKind::React)
        .instructions("Research the question and cite what you looked up.")
        .tool(lookup)
        .build()?;

    let result = agentry::run(
        &agent,
        "Why is the sky blue but sunsets red?",
        RunOptions::default(),
    )
    .await?;

    println!("{}", result.output_text());
    Ok(())
}
