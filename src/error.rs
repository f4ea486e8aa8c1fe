//! Error types for the agentry runtime.
//!
//! Every failure surfaced by the library maps onto one of the kinds below,
//! each with a stable code string (see [`Error::code`]) so callers and the
//! CLI can branch on failure class without string matching on messages.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP-level failure class reported by a provider endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Missing or rejected credentials (401/403). Never retried.
    Authentication,
    /// Rate limit hit (429). Retryable with backoff.
    RateLimited,
    /// Provider-side failure (5xx). Retryable with backoff.
    ServerError,
    /// Malformed request (other 4xx). Never retried.
    BadRequest,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorKind::Authentication => "authentication",
            ProviderErrorKind::RateLimited => "rate_limited",
            ProviderErrorKind::ServerError => "server_error",
            ProviderErrorKind::BadRequest => "bad_request",
        }
    }
}

/// A single schema violation produced by structured-output validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// JSON-pointer-style path to the offending field (e.g. `/score`).
    pub path: String,
    /// Human- and model-readable description of the violated constraint.
    pub message: String,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Main error type for the runtime
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid configuration (unknown provider tag, bad model
    /// string, missing required option).
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// HTTP-level error returned by a provider endpoint.
    #[error("Provider error ({provider}, {kind}): {message}", kind = .kind.as_str())]
    Provider {
        /// Provider tag (e.g. "openai", "anthropic").
        provider: String,
        kind: ProviderErrorKind,
        /// HTTP status when the failure came from a response.
        status: Option<u16>,
        /// Response body (or transport diagnostic) preserved verbatim.
        message: String,
    },

    /// HTTP transport failure before a status line was received.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Streaming error (malformed SSE payload, broken body).
    #[error("Streaming error: {0}")]
    Stream(String),

    /// A tool raised or returned an error after exhausting its retries.
    #[error("Tool execution error: {0}")]
    Tool(String),

    /// Structured-output parse or schema validation failed.
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        errors: Vec<FieldError>,
    },

    /// Agent loop bound hit.
    #[error("Maximum iterations exceeded ({0})")]
    MaxIterationsExceeded(u32),

    /// Per-run token/request/tool-call cap hit.
    #[error("Usage limit exceeded: {0}")]
    UsageLimitExceeded(String),

    /// Cancellation signal observed.
    #[error("Execution cancelled")]
    Cancelled,

    /// Per-tool, per-case, or per-run timeout.
    #[error("Timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Create a new configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    /// Create a new provider error
    pub fn provider(
        provider: impl Into<String>,
        kind: ProviderErrorKind,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        Error::Provider {
            provider: provider.into(),
            kind,
            status,
            message: message.into(),
        }
    }

    /// Create a new stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a new tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        Error::Tool(msg.into())
    }

    /// Create a new validation error with field-level details
    pub fn validation(msg: impl Into<String>, errors: Vec<FieldError>) -> Self {
        Error::Validation {
            message: msg.into(),
            errors,
        }
    }

    /// Create a usage-limit error
    pub fn usage_limit(msg: impl Into<String>) -> Self {
        Error::UsageLimitExceeded(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    /// Stable code string identifying the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration_error",
            Error::Provider { kind, .. } => match kind {
                ProviderErrorKind::Authentication => "provider_error/authentication",
                ProviderErrorKind::RateLimited => "provider_error/rate_limited",
                ProviderErrorKind::ServerError => "provider_error/server_error",
                ProviderErrorKind::BadRequest => "provider_error/bad_request",
            },
            Error::Http(_) => "provider_error/transport",
            Error::Json(_) => "json_error",
            Error::Stream(_) => "stream_error",
            Error::Tool(_) => "tool_error",
            Error::Validation { .. } => "validation_error",
            Error::MaxIterationsExceeded(_) => "max_iterations_exceeded",
            Error::UsageLimitExceeded(_) => "usage_limit_exceeded",
            Error::Cancelled => "execution_cancelled",
            Error::Timeout(_) => "timeout",
        }
    }

    /// Whether a failed model request may be retried with backoff.
    ///
    /// Only rate limits and transient server/transport failures qualify;
    /// authentication and bad-request errors never do.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Provider { kind, .. } => matches!(
                kind,
                ProviderErrorKind::RateLimited | ProviderErrorKind::ServerError
            ),
            Error::Http(_) => true,
            Error::Stream(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_configuration() {
        let err = Error::configuration("unknown provider tag: foo");
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(err.code(), "configuration_error");
        assert_eq!(
            err.to_string(),
            "Invalid configuration: unknown provider tag: foo"
        );
    }

    #[test]
    fn test_error_provider_codes() {
        let err = Error::provider(
            "openai",
            ProviderErrorKind::RateLimited,
            Some(429),
            "slow down",
        );
        assert_eq!(err.code(), "provider_error/rate_limited");
        assert!(err.is_retryable());

        let err = Error::provider("openai", ProviderErrorKind::Authentication, Some(401), "no");
        assert_eq!(err.code(), "provider_error/authentication");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_validation_carries_field_errors() {
        let err = Error::validation(
            "output did not match schema",
            vec![FieldError {
                path: "/score".to_string(),
                message: "must be <= 1.0".to_string(),
            }],
        );
        assert_eq!(err.code(), "validation_error");
        match err {
            Error::Validation { errors, .. } => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].to_string(), "/score: must be <= 1.0");
            }
            _ => panic!("expected validation error"),
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::configuration("x").is_retryable());
        assert!(!Error::provider("m", ProviderErrorKind::BadRequest, Some(400), "x").is_retryable());
        assert!(Error::provider("m", ProviderErrorKind::ServerError, Some(503), "x").is_retryable());
        assert!(Error::stream("connection reset").is_retryable());
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
