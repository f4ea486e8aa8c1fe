//! HTTP/SSE transport shared by all provider adapters.
//!
//! One `reqwest::Client` (and therefore one connection pool) serves the
//! whole process; adapters supply the URL, headers, and body. Two
//! operations exist: a plain JSON POST ([`post_json`]) and a streaming POST
//! ([`post_sse`]) whose response body is interpreted as Server-Sent Events.
//!
//! HTTP statuses >= 400 map to typed provider errors with the response body
//! preserved for diagnostics. SSE framing (blank-line event boundaries,
//! `data:` concatenation) is handled by `eventsource-stream`; the `[DONE]`
//! sentinel terminates the stream. The chunk stream is pull-based, so a
//! slow consumer pauses HTTP body reads rather than growing a buffer.
//!
//! No automatic reconnection: a stream that errors mid-flight yields an
//! `Err` item and ends; the caller decides what to do.

use crate::error::{Error, ProviderErrorKind, Result};
use eventsource_stream::Eventsource;
use futures::stream::{Stream, StreamExt};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;

/// Stream of raw provider chunks: opaque JSON values until the SSE stream
/// ends or an error terminates it.
pub type RawChunkStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

// Process-wide pool; per-request timeouts are applied on the request
// builder, not the client.
static HTTP: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .build()
        .expect("Failed to build HTTP client")
});

/// Maps an HTTP error status to the typed provider-error taxonomy.
pub fn status_to_error(provider: &str, status: u16, body: String) -> Error {
    let kind = match status {
        401 | 403 => ProviderErrorKind::Authentication,
        429 => ProviderErrorKind::RateLimited,
        s if s >= 500 => ProviderErrorKind::ServerError,
        _ => ProviderErrorKind::BadRequest,
    };
    Error::provider(provider, kind, Some(status), body)
}

async fn send(
    provider: &str,
    url: &str,
    headers: &[(String, String)],
    body: &Value,
    timeout: Duration,
) -> Result<reqwest::Response> {
    let mut request = HTTP.post(url).timeout(timeout).json(body);
    for (name, value) in headers {
        request = request.header(name, value);
    }

    let response = request.send().await.map_err(Error::Http)?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        return Err(status_to_error(provider, status.as_u16(), body));
    }

    Ok(response)
}

/// POSTs a JSON body and parses the JSON response.
pub async fn post_json(
    provider: &str,
    url: &str,
    headers: &[(String, String)],
    body: &Value,
    timeout: Duration,
) -> Result<Value> {
    let response = send(provider, url, headers, body, timeout).await?;
    response.json::<Value>().await.map_err(Error::Http)
}

/// POSTs a JSON body and returns the response as a stream of SSE data
/// payloads, each parsed to a JSON value.
///
/// The adapter is responsible for setting the provider's streaming flag in
/// the body (`"stream": true` or the endpoint variant).
pub async fn post_sse(
    provider: &str,
    url: &str,
    headers: &[(String, String)],
    body: &Value,
    timeout: Duration,
) -> Result<RawChunkStream> {
    let response = send(provider, url, headers, body, timeout).await?;
    Ok(sse_chunks(response.bytes_stream()))
}

/// Interprets a byte stream as SSE and yields each `data:` payload as JSON.
///
/// Factored out of [`post_sse`] so the framing rules are testable without
/// a live HTTP response.
pub fn sse_chunks<S, B, E>(bytes: S) -> RawChunkStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let stream = bytes
        .eventsource()
        .take_while(|event| {
            let done = matches!(event, Ok(e) if e.data.trim() == "[DONE]");
            futures::future::ready(!done)
        })
        .filter_map(|event| async move {
            match event {
                Ok(e) => {
                    if e.data.is_empty() {
                        return None;
                    }
                    match serde_json::from_str::<Value>(&e.data) {
                        Ok(value) => Some(Ok(value)),
                        Err(err) => Some(Err(Error::stream(format!(
                            "failed to parse SSE payload: {}",
                            err
                        )))),
                    }
                }
                Err(err) => Some(Err(Error::stream(format!("SSE transport error: {}", err)))),
            }
        });

    Box::pin(stream)
}
