//! Tool definition system.
//!
//! A [`Tool`] bundles the metadata a model needs to decide when to call it
//! (name, description, parameter schema) with the async Rust function that
//! runs when it does. Handlers receive the run's [`RunContext`] plus the
//! parsed arguments, so tools can read caller-supplied dependencies.
//!
//! Parameter schemas accept three notations, all normalized to full JSON
//! Schema before they reach a provider:
//!
//! - simple type notation: `{"location": "string", "count": "integer"}`
//! - extended properties: `{"q": {"type": "string", "description": "..."}}`
//!   (with `"optional": true` / `"required": false` / `"default"` marking
//!   optional parameters)
//! - full JSON Schema: passed through unchanged
//!
//! # Example
//!
//! ```
//! use agentry::tool;
//! use serde_json::json;
//!
//! let add = tool("add", "Add two numbers")
//!     .param("a", "number")
//!     .param("b", "number")
//!     .build(|_ctx, args| async move {
//!         let a = args["a"].as_f64().unwrap_or(0.0);
//!         let b = args["b"].as_f64().unwrap_or(0.0);
//!         Ok(json!({"result": a + b}))
//!     });
//! assert_eq!(add.name(), "add");
//! ```

use crate::context::RunContext;
use crate::Result;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Boxed async tool handler: `(run context, arguments) -> result value`.
pub type ToolHandler = Arc<
    dyn Fn(RunContext, Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync,
>;

/// Result map key whose value is merged into the run's `deps` before the
/// next iteration. Stripped from the result before it reaches the model.
pub const UPDATE_CONTEXT_KEY: &str = "__update_context__";

/// Schema-only view of a tool, as sent to providers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// Full JSON Schema for the arguments object.
    pub parameters: Value,
}

/// A callable tool: metadata plus handler plus execution policy.
///
/// Tools are immutable once built and cheap to clone (the handler is
/// `Arc`-shared), so the same tool can serve many concurrent runs.
#[derive(Clone)]
pub struct Tool {
    name: String,
    description: String,
    parameters: Value,
    handler: ToolHandler,
    retries: u32,
    requires_approval: bool,
    timeout: Option<Duration>,
}

impl Tool {
    /// Creates a tool from a name, description, parameter schema (any of
    /// the accepted notations), and an async handler.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(RunContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: normalize_schema(parameters),
            handler: Arc::new(move |ctx, args| Box::pin(handler(ctx, args))),
            retries: 0,
            requires_approval: false,
            timeout: None,
        }
    }

    /// Invokes the handler. The executor wraps this with retries, timeout,
    /// and telemetry; call it directly only in tests.
    pub async fn invoke(&self, ctx: RunContext, arguments: Value) -> Result<Value> {
        (self.handler)(ctx, arguments).await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// The normalized JSON Schema of the arguments object.
    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    /// Number of retries after a failed invocation.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn requires_approval(&self) -> bool {
        self.requires_approval
    }

    /// Per-tool timeout; the agent default applies when unset.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Sets how many times a failed invocation is retried.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Marks the tool as requiring per-run approval.
    pub fn with_approval_required(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    /// Sets the per-invocation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Schema-only view for provider translation.
    pub fn def(&self) -> ToolDef {
        ToolDef {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

// The handler is not debuggable; show metadata only.
impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .field("retries", &self.retries)
            .field("requires_approval", &self.requires_approval)
            .finish()
    }
}

/// Starts a [`ToolBuilder`]; the common way to define tools.
pub fn tool(name: impl Into<String>, description: impl Into<String>) -> ToolBuilder {
    ToolBuilder {
        name: name.into(),
        description: description.into(),
        properties: serde_json::Map::new(),
        required: Vec::new(),
        retries: 0,
        requires_approval: false,
        timeout: None,
    }
}

/// Incrementally assembles a tool's parameter schema and policy.
#[derive(Debug)]
pub struct ToolBuilder {
    name: String,
    description: String,
    properties: serde_json::Map<String, Value>,
    required: Vec<String>,
    retries: u32,
    requires_approval: bool,
    timeout: Option<Duration>,
}

impl ToolBuilder {
    /// Adds a required parameter with a simple type ("string", "number",
    /// "integer", "boolean", "array", "object").
    pub fn param(mut self, name: impl Into<String>, type_name: &str) -> Self {
        let name = name.into();
        self.properties
            .insert(name.clone(), type_keyword_schema(type_name));
        self.required.push(name);
        self
    }

    /// Adds an optional parameter with a simple type.
    pub fn optional_param(mut self, name: impl Into<String>, type_name: &str) -> Self {
        self.properties
            .insert(name.into(), type_keyword_schema(type_name));
        self
    }

    /// Adds a parameter with an explicit JSON Schema fragment.
    pub fn param_schema(mut self, name: impl Into<String>, schema: Value, required: bool) -> Self {
        let name = name.into();
        self.properties.insert(name.clone(), schema);
        if required {
            self.required.push(name);
        }
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn requires_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Finishes the definition with the handler.
    pub fn build<F, Fut>(self, handler: F) -> Tool
    where
        F: Fn(RunContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let schema = serde_json::json!({
            "type": "object",
            "properties": self.properties,
            "required": self.required,
        });
        let mut built =
            Tool::new(self.name, self.description, schema, handler).with_retries(self.retries);
        if self.requires_approval {
            built = built.with_approval_required();
        }
        if let Some(timeout) = self.timeout {
            built = built.with_timeout(timeout);
        }
        built
    }
}

/// Strips the trailing noise some providers append to tool names
/// (XML-ish fragments, stray punctuation), keeping the leading identifier.
pub fn sanitize_tool_name(raw: &str) -> &str {
    let end = raw
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        .unwrap_or(raw.len());
    &raw[..end]
}

/// Normalizes any accepted schema notation to full JSON Schema.
fn normalize_schema(schema: Value) -> Value {
    let Some(obj) = schema.as_object() else {
        return serde_json::json!({
            "type": "object",
            "properties": {},
            "required": [],
        });
    };

    // Already a full JSON Schema.
    if obj.contains_key("type") && obj.contains_key("properties") {
        return schema;
    }

    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();

    for (param_name, param_spec) in obj {
        if let Some(type_str) = param_spec.as_str() {
            // Simple notation: always required.
            properties.insert(param_name.clone(), type_keyword_schema(type_str));
            required.push(param_name.clone());
        } else if param_spec.is_object() {
            let mut prop = param_spec.clone();
            let prop_obj = prop.as_object_mut().expect("object checked above");

            let is_optional = prop_obj
                .remove("optional")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let is_required = prop_obj.remove("required").and_then(|v| v.as_bool());
            let has_default = prop_obj.contains_key("default");

            properties.insert(param_name.clone(), prop);

            if let Some(true) = is_required {
                required.push(param_name.clone());
            } else if is_optional || is_required == Some(false) {
                // Explicitly optional.
            } else if !has_default {
                required.push(param_name.clone());
            }
        }
    }

    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Maps a friendly type keyword to its JSON Schema type object. Unknown
/// keywords fall back to "string".
fn type_keyword_schema(type_name: &str) -> Value {
    let json_type = match type_name {
        "string" | "str" => "string",
        "number" | "float" | "f32" | "f64" => "number",
        "integer" | "int" | "i32" | "i64" | "u32" | "u64" => "integer",
        "boolean" | "bool" => "boolean",
        "array" | "list" | "vec" => "array",
        "object" | "dict" | "map" => "object",
        _ => "string",
    };
    serde_json::json!({"type": json_type})
}
