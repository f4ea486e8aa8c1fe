//! Model configuration and `"provider:model"` parsing.
//!
//! A [`Model`] is the immutable description of one model endpoint: which
//! provider dialect to speak, where to send requests, which credential to
//! use, and the default request settings. Parse one from a
//! `"provider:model"` string:
//!
//! ```
//! use agentry::{Model, Provider};
//!
//! let model = Model::parse("openai:gpt-4o-mini").unwrap();
//! assert_eq!(model.provider, Provider::OpenAi);
//! assert_eq!(model.name, "gpt-4o-mini");
//! assert_eq!(model.base_url, "https://api.openai.com/v1");
//! ```
//!
//! A missing API key for a cloud provider is not an error at parse time;
//! the request fails later with `provider_error/authentication` so that
//! configuration can be assembled before credentials are available.

use crate::error::{Error, Result};
use crate::stream::NormalizerKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Supported provider tags.
///
/// | Tag | Dialect | Default endpoint |
/// |-----|---------|------------------|
/// | openai | OpenAI | https://api.openai.com/v1 |
/// | anthropic | Anthropic | https://api.anthropic.com/v1 |
/// | gemini | Gemini | https://generativelanguage.googleapis.com/v1beta |
/// | mistral | Mistral | https://api.mistral.ai/v1 |
/// | groq | OpenAI | https://api.groq.com/openai/v1 |
/// | openrouter | OpenAI | https://openrouter.ai/api/v1 |
/// | together | OpenAI | https://api.together.xyz/v1 |
/// | ollama | OpenAI | http://localhost:11434/v1 |
/// | lmstudio | OpenAI | http://localhost:1234/v1 |
/// | vllm | OpenAI | http://localhost:8000/v1 |
/// | sglang | OpenAI | http://localhost:30000/v1 |
/// | custom | OpenAI | (explicit base URL required) |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Gemini,
    Mistral,
    Groq,
    Ollama,
    LmStudio,
    Vllm,
    Sglang,
    OpenRouter,
    Together,
    Custom,
}

impl Provider {
    /// Canonical lowercase tag, as used in model spec strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Gemini => "gemini",
            Provider::Mistral => "mistral",
            Provider::Groq => "groq",
            Provider::Ollama => "ollama",
            Provider::LmStudio => "lmstudio",
            Provider::Vllm => "vllm",
            Provider::Sglang => "sglang",
            Provider::OpenRouter => "openrouter",
            Provider::Together => "together",
            Provider::Custom => "custom",
        }
    }

    /// Default base URL, when the provider has a well-known one.
    ///
    /// Local inference servers get their documented localhost defaults;
    /// `custom` has none and must be configured explicitly.
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Provider::OpenAi => Some("https://api.openai.com/v1"),
            Provider::Anthropic => Some("https://api.anthropic.com/v1"),
            Provider::Gemini => Some("https://generativelanguage.googleapis.com/v1beta"),
            Provider::Mistral => Some("https://api.mistral.ai/v1"),
            Provider::Groq => Some("https://api.groq.com/openai/v1"),
            Provider::OpenRouter => Some("https://openrouter.ai/api/v1"),
            Provider::Together => Some("https://api.together.xyz/v1"),
            Provider::Ollama => Some("http://localhost:11434/v1"),
            Provider::LmStudio => Some("http://localhost:1234/v1"),
            Provider::Vllm => Some("http://localhost:8000/v1"),
            Provider::Sglang => Some("http://localhost:30000/v1"),
            Provider::Custom => None,
        }
    }

    /// Environment variable consulted for the API key when none is given.
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            Provider::OpenAi => Some("OPENAI_API_KEY"),
            Provider::Anthropic => Some("ANTHROPIC_API_KEY"),
            Provider::Gemini => Some("GEMINI_API_KEY"),
            Provider::Mistral => Some("MISTRAL_API_KEY"),
            Provider::Groq => Some("GROQ_API_KEY"),
            _ => None,
        }
    }

    /// Environment variable consulted for the base URL when none is given,
    /// e.g. `OLLAMA_BASE_URL`.
    pub fn base_url_env(&self) -> String {
        format!("{}_BASE_URL", self.as_str().to_uppercase())
    }

    /// Whether a missing API key should fail at request time.
    ///
    /// Local servers typically run unauthenticated, so only hosted
    /// providers demand a credential.
    pub fn requires_api_key(&self) -> bool {
        self.api_key_env().is_some()
    }

    /// Whether the provider speaks the OpenAI chat-completions dialect.
    pub fn is_openai_compatible(&self) -> bool {
        !matches!(self, Provider::Anthropic | Provider::Gemini)
    }

    /// Whether the provider supports token-level guided decoding
    /// (choice lists, regex, grammars).
    pub fn supports_guided_decoding(&self) -> bool {
        matches!(self, Provider::Vllm | Provider::Sglang)
    }

    /// Default stream-normalizer for this provider's wire format.
    pub fn default_normalizer(&self) -> NormalizerKind {
        match self {
            Provider::Mistral => NormalizerKind::Mistral,
            _ => NormalizerKind::OpenAi,
        }
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "anthropic" => Ok(Provider::Anthropic),
            "gemini" => Ok(Provider::Gemini),
            "mistral" => Ok(Provider::Mistral),
            "groq" => Ok(Provider::Groq),
            "ollama" => Ok(Provider::Ollama),
            "lmstudio" | "lm-studio" | "lm_studio" => Ok(Provider::LmStudio),
            "vllm" => Ok(Provider::Vllm),
            "sglang" => Ok(Provider::Sglang),
            "openrouter" => Ok(Provider::OpenRouter),
            "together" => Ok(Provider::Together),
            "custom" => Ok(Provider::Custom),
            other => Err(Error::configuration(format!(
                "invalid_model_string: unknown provider tag '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-request generation settings.
///
/// Layered: the agent's defaults are merged under run-level overrides, and
/// the structured-output plan merges on top of both. Unknown or
/// provider-specific knobs (Anthropic thinking budget, Mistral safe_prompt,
/// vLLM guided decoding) travel in `extra` and are interpreted by the
/// adapters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /// Canonical response-format request. Adapters translate to the
    /// provider's own field (`response_format`, `response_schema`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    /// Tool selection: `"auto"`, `"none"`, `"required"`, or a tool name to
    /// force. Adapters translate to the provider's tool_choice shape.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    /// Provider-specific passthrough settings.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl ModelSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns these settings with `overrides` layered on top. Fields set
    /// in `overrides` win; `extra` maps are merged key-wise.
    pub fn merged(&self, overrides: &ModelSettings) -> ModelSettings {
        let mut extra = self.extra.clone();
        for (k, v) in &overrides.extra {
            extra.insert(k.clone(), v.clone());
        }
        ModelSettings {
            temperature: overrides.temperature.or(self.temperature),
            max_tokens: overrides.max_tokens.or(self.max_tokens),
            top_p: overrides.top_p.or(self.top_p),
            stop: overrides.stop.clone().or_else(|| self.stop.clone()),
            response_format: overrides
                .response_format
                .clone()
                .or_else(|| self.response_format.clone()),
            tool_choice: overrides
                .tool_choice
                .clone()
                .or_else(|| self.tool_choice.clone()),
            extra,
        }
    }
}

/// Immutable model configuration produced by [`Model::parse`] or
/// [`Model::builder`]. Lives as long as the agent that holds it.
#[derive(Clone)]
pub struct Model {
    pub provider: Provider,
    /// Provider-side model identifier (e.g. "gpt-4o", "claude-sonnet-4-5").
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub organization: Option<String>,
    /// HTTP timeout applied per request.
    pub timeout: Duration,
    /// Default settings merged under every request's settings.
    pub settings: ModelSettings,
    /// Which built-in normalizer interprets this model's stream chunks.
    pub normalizer: NormalizerKind,
}

// Keeps credentials out of logs.
impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("provider", &self.provider)
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Model {
    /// Parses a `"provider:model"` string with all-default options.
    pub fn parse(spec: &str) -> Result<Model> {
        Model::builder(spec)?.build()
    }

    /// Starts a builder from a `"provider:model"` string.
    ///
    /// # Errors
    ///
    /// `configuration_error` (`invalid_model_string`) when the colon is
    /// missing or the provider tag is unknown.
    pub fn builder(spec: &str) -> Result<ModelBuilder> {
        let (tag, name) = spec.split_once(':').ok_or_else(|| {
            Error::configuration(format!(
                "invalid_model_string: expected '<provider>:<model>', got '{}'",
                spec
            ))
        })?;
        let provider: Provider = tag.parse()?;
        if name.trim().is_empty() {
            return Err(Error::configuration(
                "invalid_model_string: model name is empty",
            ));
        }
        Ok(ModelBuilder {
            provider,
            name: name.to_string(),
            base_url: None,
            api_key: None,
            organization: None,
            timeout: None,
            settings: ModelSettings::default(),
            normalizer: None,
        })
    }

    /// The tag string for diagnostics, e.g. `"openai:gpt-4o"`.
    pub fn spec(&self) -> String {
        format!("{}:{}", self.provider, self.name)
    }
}

/// Builder for [`Model`] carrying the optional configuration knobs.
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    provider: Provider,
    name: String,
    base_url: Option<String>,
    api_key: Option<String>,
    organization: Option<String>,
    timeout: Option<Duration>,
    settings: ModelSettings,
    normalizer: Option<NormalizerKind>,
}

impl ModelBuilder {
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn organization(mut self, org: impl Into<String>) -> Self {
        self.organization = Some(org.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Default settings merged under every request.
    pub fn settings(mut self, settings: ModelSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn normalizer(mut self, kind: NormalizerKind) -> Self {
        self.normalizer = Some(kind);
        self
    }

    /// Resolves the base URL (explicit, then env, then provider default)
    /// and the API key (explicit, then env). A missing key is deferred to
    /// request time; a missing base URL for `custom` fails here.
    pub fn build(self) -> Result<Model> {
        let base_url = match self.base_url {
            Some(url) => url,
            None => match env::var(self.provider.base_url_env()) {
                Ok(url) => url,
                Err(_) => self
                    .provider
                    .default_base_url()
                    .map(str::to_string)
                    .ok_or_else(|| {
                        Error::configuration(format!(
                            "provider '{}' requires a base_url (or {})",
                            self.provider,
                            self.provider.base_url_env()
                        ))
                    })?,
            },
        };
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::configuration(
                "base_url must start with http:// or https://",
            ));
        }

        let api_key = self.api_key.or_else(|| {
            self.provider
                .api_key_env()
                .and_then(|var| env::var(var).ok())
        });

        let normalizer = self
            .normalizer
            .unwrap_or_else(|| self.provider.default_normalizer());

        Ok(Model {
            provider: self.provider,
            name: self.name,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            organization: self.organization,
            timeout: self.timeout.unwrap_or(Duration::from_secs(60)),
            settings: self.settings,
            normalizer,
        })
    }
}
