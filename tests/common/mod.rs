//! Shared test support: a scripted stand-in for a chat provider.
#![allow(dead_code)]

use agentry::{
    ChatModel, ChatResponse, Error, EventStream, FinishReason, Message, Model, ModelSettings,
    Part, Result, StreamEvent, ToolCall, ToolDef, Usage,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A [`ChatModel`] that replays scripted responses in order and records
/// every request it receives.
pub struct MockChatModel {
    script: Mutex<VecDeque<ChatResponse>>,
    fallback: Option<ChatResponse>,
    /// The message lists of every request, in arrival order.
    pub requests: Mutex<Vec<Vec<Message>>>,
}

impl MockChatModel {
    /// Replays `responses` in order; errors when the script runs dry.
    pub fn scripted(responses: Vec<ChatResponse>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(responses.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Returns the same response for every request.
    pub fn always(response: ChatResponse) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(response),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// The nth request's message list.
    pub fn request(&self, n: usize) -> Vec<Message> {
        self.requests.lock().unwrap()[n].clone()
    }
}

fn one_request_usage() -> Usage {
    let mut usage = Usage::new();
    usage.inc_requests();
    usage.add_tokens(10, 5);
    usage
}

/// A plain text assistant response.
pub fn text_response(text: &str) -> ChatResponse {
    ChatResponse {
        message: Message::assistant_text(text),
        usage: one_request_usage(),
        finish: FinishReason::Stop,
    }
}

/// An assistant response carrying tool calls, in the given order.
pub fn tool_call_response(calls: Vec<(&str, &str, serde_json::Value)>) -> ChatResponse {
    let parts = calls
        .into_iter()
        .map(|(id, name, arguments)| Part::ToolCall(ToolCall::new(id, name, arguments)))
        .collect();
    ChatResponse {
        message: Message::assistant(parts),
        usage: one_request_usage(),
        finish: FinishReason::ToolCalls,
    }
}

#[async_trait]
impl ChatModel for MockChatModel {
    async fn request(
        &self,
        _model: &Model,
        messages: &[Message],
        _tools: &[ToolDef],
        _settings: &ModelSettings,
    ) -> Result<ChatResponse> {
        self.requests.lock().unwrap().push(messages.to_vec());
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return Ok(next);
        }
        if let Some(fallback) = &self.fallback {
            return Ok(fallback.clone());
        }
        Err(Error::stream("mock script exhausted"))
    }

    async fn request_stream(
        &self,
        model: &Model,
        messages: &[Message],
        tools: &[ToolDef],
        settings: &ModelSettings,
    ) -> Result<EventStream> {
        let response = ChatModel::request(self, model, messages, tools, settings).await?;

        let mut events: Vec<Result<StreamEvent>> = Vec::new();
        let text = response.message.text();
        if !text.is_empty() {
            // Split so consumers see more than one delta.
            let mid = text.len() / 2;
            let (head, tail) = text.split_at(mid);
            if !head.is_empty() {
                events.push(Ok(StreamEvent::TextDelta(head.to_string())));
            }
            if !tail.is_empty() {
                events.push(Ok(StreamEvent::TextDelta(tail.to_string())));
            }
        }
        for call in response.message.tool_calls() {
            events.push(Ok(StreamEvent::ToolCallDelta(call.clone())));
        }
        events.push(Ok(StreamEvent::Usage(response.usage)));
        events.push(Ok(StreamEvent::Finish(response.finish)));
        Ok(Box::pin(futures::stream::iter(events)))
    }
}

/// A test model that never touches the network or the environment.
pub fn test_model() -> Model {
    Model::builder("openai:gpt-4o-mini")
        .expect("valid model spec")
        .api_key("sk-test")
        .build()
        .expect("model builds")
}
