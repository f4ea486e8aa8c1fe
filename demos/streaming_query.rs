//! Token-by-token streaming from a local or hosted model.
//!
//! ```sh
//! cargo run --example streaming_query          # expects Ollama on :11434
//! ```

use agentry::{Agent, Model, RunOptions, StreamEvent};
use futures::StreamExt;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let agent = Agent::builder()
        .model(Model::parse("ollama:llama3.1:8b")?)
        .instructions("You are a concise assistant.")
        .build()?;

    let mut events = agentry::run_stream(
        &agent,
        "Explain what an SSE stream is in two sentences.",
        RunOptions::default(),
    )
    .await?;

    while let Some(event) = events.next().await {
        match event? {
            StreamEvent::TextDelta(text) => print!("{}", text),
            StreamEvent::Finish(reason) => println!("\n[finish: {}]", reason.as_str()),
            _ => {}
        }
    }
    Ok(())
}
