//! Process-wide telemetry bus.
//!
//! The runtime emits span events at the start, stop, and exception of three
//! operations: `agent.run`, `model.request`, and `tool.execute`. Handlers
//! subscribe by name and receive every event; the default handler forwards
//! to the `log` crate. Durations are measured in monotonic time
//! ([`std::time::Instant`]) and reported in nanoseconds; subscribers
//! convert as needed.
//!
//! ```
//! use agentry::telemetry::{self, Event};
//!
//! telemetry::attach("print-spans", |event: &Event| {
//!     println!("{} {:?}", event.span, event.phase);
//! });
//! # telemetry::detach("print-spans");
//! ```

use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Span name for agent runs.
pub const AGENT_RUN: &str = "agent.run";
/// Span name for model requests.
pub const MODEL_REQUEST: &str = "model.request";
/// Span name for tool executions.
pub const TOOL_EXECUTE: &str = "tool.execute";

/// Where in the span lifecycle an event was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Stop,
    Exception,
}

/// A single telemetry event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Span name: [`AGENT_RUN`], [`MODEL_REQUEST`], or [`TOOL_EXECUTE`].
    pub span: &'static str,
    pub phase: Phase,
    /// Numeric measurements. Stop and exception events carry
    /// `duration_ns`; agent-run stops add token/request/tool-call counts.
    pub measurements: Map<String, Value>,
    /// Identifying metadata (agent name, provider, model name, tool name).
    pub metadata: Map<String, Value>,
}

/// Subscriber callback.
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

static REGISTRY: Lazy<RwLock<HashMap<String, Handler>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Attaches a named handler. Re-attaching under the same name replaces the
/// previous handler.
pub fn attach<F>(name: impl Into<String>, handler: F)
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    if let Ok(mut registry) = REGISTRY.write() {
        registry.insert(name.into(), Arc::new(handler));
    }
}

/// Detaches the handler registered under `name`, if any.
pub fn detach(name: &str) {
    if let Ok(mut registry) = REGISTRY.write() {
        registry.remove(name);
    }
}

/// Publishes an event to every attached handler.
pub fn emit(event: &Event) {
    let handlers: Vec<Handler> = match REGISTRY.read() {
        Ok(registry) => registry.values().cloned().collect(),
        Err(_) => return,
    };
    for handler in handlers {
        handler(event);
    }
}

/// An in-flight span. Created with [`Span::start`] (which emits the start
/// event); consumed by [`Span::stop`] or [`Span::exception`].
pub struct Span {
    span: &'static str,
    started: Instant,
    metadata: Map<String, Value>,
}

impl Span {
    /// Opens a span and emits its start event.
    pub fn start(span: &'static str, metadata: Map<String, Value>) -> Self {
        emit(&Event {
            span,
            phase: Phase::Start,
            measurements: Map::new(),
            metadata: metadata.clone(),
        });
        Self {
            span,
            started: Instant::now(),
            metadata,
        }
    }

    /// Elapsed monotonic time since the span opened.
    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    /// Closes the span successfully, attaching extra measurements.
    pub fn stop(self, mut measurements: Map<String, Value>) {
        measurements.insert(
            "duration_ns".to_string(),
            Value::from(self.started.elapsed().as_nanos() as u64),
        );
        emit(&Event {
            span: self.span,
            phase: Phase::Stop,
            measurements,
            metadata: self.metadata,
        });
    }

    /// Closes the span with an error.
    pub fn exception(self, error: &str) {
        let mut measurements = Map::new();
        measurements.insert(
            "duration_ns".to_string(),
            Value::from(self.started.elapsed().as_nanos() as u64),
        );
        let mut metadata = self.metadata;
        metadata.insert("error".to_string(), Value::from(error));
        emit(&Event {
            span: self.span,
            phase: Phase::Exception,
            measurements,
            metadata,
        });
    }
}

/// Attaches the default subscriber that forwards events to the `log` crate:
/// exceptions at error, agent-run stops at info, everything else at debug.
pub fn attach_default_logger() {
    attach("agentry-default-logger", |event: &Event| match event.phase {
        Phase::Exception => {
            log::error!(
                "{} failed: {} ({})",
                event.span,
                event
                    .metadata
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown"),
                format_metadata(&event.metadata)
            );
        }
        Phase::Stop if event.span == AGENT_RUN => {
            log::info!(
                "{} completed in {} ms ({})",
                event.span,
                duration_ms(&event.measurements),
                format_metadata(&event.metadata)
            );
        }
        Phase::Stop => {
            log::debug!(
                "{} completed in {} ms ({})",
                event.span,
                duration_ms(&event.measurements),
                format_metadata(&event.metadata)
            );
        }
        Phase::Start => {
            log::debug!("{} started ({})", event.span, format_metadata(&event.metadata));
        }
    });
}

/// Removes the default subscriber.
pub fn detach_default_logger() {
    detach("agentry-default-logger");
}

fn duration_ms(measurements: &Map<String, Value>) -> u64 {
    measurements
        .get("duration_ns")
        .and_then(Value::as_u64)
        .unwrap_or(0)
        / 1_000_000
}

fn format_metadata(metadata: &Map<String, Value>) -> String {
    metadata
        .iter()
        .filter(|(k, _)| *k != "error")
        .map(|(k, v)| match v {
            Value::String(s) => format!("{}={}", k, s),
            other => format!("{}={}", k, other),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Convenience for building metadata maps.
pub(crate) fn meta(pairs: &[(&str, &str)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::from(*v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The registry is process-global; serialize these tests so spans from
    // one test never land in another test's capture handler.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_span_emits_start_and_stop() {
        let _guard = TEST_LOCK.lock().unwrap();
        let seen: Arc<Mutex<Vec<(String, Phase)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        attach("test-span-capture", move |event: &Event| {
            sink.lock()
                .unwrap()
                .push((event.span.to_string(), event.phase));
        });

        let span = Span::start(TOOL_EXECUTE, meta(&[("tool_name", "add")]));
        span.stop(Map::new());

        detach("test-span-capture");

        let events = seen.lock().unwrap();
        assert!(events.contains(&(TOOL_EXECUTE.to_string(), Phase::Start)));
        assert!(events.contains(&(TOOL_EXECUTE.to_string(), Phase::Stop)));
    }

    #[test]
    fn test_stop_attaches_duration() {
        let _guard = TEST_LOCK.lock().unwrap();
        let seen: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        attach("test-duration-capture", move |event: &Event| {
            sink.lock().unwrap().push(event.clone());
        });

        let span = Span::start(MODEL_REQUEST, Map::new());
        span.stop(Map::new());

        detach("test-duration-capture");

        let events = seen.lock().unwrap();
        let stop = events
            .iter()
            .find(|e| e.phase == Phase::Stop)
            .expect("stop event");
        assert!(stop.measurements.contains_key("duration_ns"));
    }

    #[test]
    fn test_exception_carries_error() {
        let _guard = TEST_LOCK.lock().unwrap();
        let seen: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        attach("test-exception-capture", move |event: &Event| {
            sink.lock().unwrap().push(event.clone());
        });

        let span = Span::start(AGENT_RUN, Map::new());
        span.exception("boom");

        detach("test-exception-capture");

        let events = seen.lock().unwrap();
        let exc = events
            .iter()
            .find(|e| e.phase == Phase::Exception)
            .expect("exception event");
        assert_eq!(exc.metadata.get("error").and_then(Value::as_str), Some("boom"));
    }

    #[test]
    fn test_detach_stops_delivery() {
        let _guard = TEST_LOCK.lock().unwrap();
        let seen: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
        let sink = seen.clone();
        attach("test-detach", move |event: &Event| {
            if event.metadata.get("probe").and_then(Value::as_str) == Some("detach-test") {
                *sink.lock().unwrap() += 1;
            }
        });
        detach("test-detach");

        Span::start(AGENT_RUN, meta(&[("probe", "detach-test")])).stop(Map::new());
        assert_eq!(*seen.lock().unwrap(), 0);
    }
}
