//! Fluent request builder for LLM generation.
//!
//! A request accumulates conversation messages, model parameters, a
//! per-request context map, and an optional structured-output schema, then
//! hands itself to the owning agent's loop.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{MeshError, Result};
use crate::llm::extract::extract_json;
use crate::llm::LlmAgent;

/// How the per-request context combines with the auto-injected invocation
/// context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextMode {
    /// Per-request context only
    Replace,
    /// Auto-injected entries win on conflict
    Prepend,
    /// Per-request entries win on conflict
    #[default]
    Append,
}

/// One conversation message in provider wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Value::String(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Assistant turn carrying the tool calls the model requested.
    pub fn assistant_with_tool_calls(content: Value, tool_calls: Value) -> Self {
        Self {
            role: "assistant".to_string(),
            content,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    /// Tool-result turn answering one tool call.
    pub fn tool_result(tool_call_id: Option<String>, content: String) -> Self {
        Self {
            role: "tool".to_string(),
            content: Value::String(content),
            tool_calls: None,
            tool_call_id,
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == "system"
    }
}

/// Model parameters for one request.
#[derive(Debug, Clone, Default)]
pub struct ModelParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop: Option<Vec<String>>,
}

impl ModelParams {
    /// Overlay request-level values onto agent defaults.
    pub fn merged_with(&self, defaults: &ModelParams) -> ModelParams {
        ModelParams {
            max_tokens: self.max_tokens.or(defaults.max_tokens),
            temperature: self.temperature.or(defaults.temperature),
            top_p: self.top_p.or(defaults.top_p),
            stop: self.stop.clone().or_else(|| defaults.stop.clone()),
        }
    }

    /// Wire map under `model_params`.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(max_tokens) = self.max_tokens {
            map.insert("max_tokens".to_string(), max_tokens.into());
        }
        if let Some(temperature) = self.temperature {
            map.insert("temperature".to_string(), temperature.into());
        }
        if let Some(top_p) = self.top_p {
            map.insert("top_p".to_string(), top_p.into());
        }
        if let Some(stop) = &self.stop {
            map.insert(
                "stop".to_string(),
                Value::Array(stop.iter().cloned().map(Value::String).collect()),
            );
        }
        map
    }
}

/// Fluent builder returned by [`LlmAgent::request`].
pub struct GenerateRequest<'a> {
    pub(crate) agent: &'a LlmAgent,
    pub(crate) messages: Vec<ChatMessage>,
    pub(crate) params: ModelParams,
    pub(crate) context: Map<String, Value>,
    pub(crate) context_mode: ContextMode,
    pub(crate) response_schema: Option<(String, Value)>,
    pub(crate) max_iterations: Option<u32>,
}

impl<'a> GenerateRequest<'a> {
    pub(crate) fn new(agent: &'a LlmAgent) -> Self {
        Self {
            agent,
            messages: Vec::new(),
            params: ModelParams::default(),
            context: Map::new(),
            context_mode: ContextMode::default(),
            response_schema: None,
            max_iterations: None,
        }
    }

    /// Add an explicit system message, suppressing the rendered template.
    pub fn system(mut self, content: impl Into<String>) -> Self {
        self.messages.push(ChatMessage::new("system", content));
        self
    }

    /// Add a user message.
    pub fn user(mut self, content: impl Into<String>) -> Self {
        self.messages.push(ChatMessage::new("user", content));
        self
    }

    /// Add an assistant message.
    pub fn assistant(mut self, content: impl Into<String>) -> Self {
        self.messages.push(ChatMessage::new("assistant", content));
        self
    }

    /// Add a message with an arbitrary role.
    pub fn message(mut self, role: impl Into<String>, content: impl Into<String>) -> Self {
        self.messages.push(ChatMessage::new(role, content));
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.params.max_tokens = Some(max_tokens);
        self
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.params.temperature = Some(temperature);
        self
    }

    pub fn top_p(mut self, top_p: f64) -> Self {
        self.params.top_p = Some(top_p);
        self
    }

    pub fn stop(mut self, stop: Vec<String>) -> Self {
        self.params.stop = Some(stop);
        self
    }

    /// Add one entry to the per-request template context.
    pub fn context_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Replace the whole per-request context map.
    pub fn context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn context_mode(mut self, mode: ContextMode) -> Self {
        self.context_mode = mode;
        self
    }

    /// Request structured output conforming to `schema`.
    ///
    /// Emits `output_schema` and `output_type_name` in the model params.
    pub fn response_schema(mut self, type_name: impl Into<String>, schema: Value) -> Self {
        self.response_schema = Some((type_name.into(), schema));
        self
    }

    /// Override the agent's iteration cap for this request.
    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    /// Run the agentic loop and return the final textual content.
    pub async fn generate(self) -> Result<String> {
        let agent = self.agent;
        agent.run_loop(self).await
    }

    /// Run the loop and deserialize the extracted JSON payload.
    pub async fn generate_as<T: DeserializeOwned>(self) -> Result<T> {
        let text = self.generate().await?;
        let value = extract_json(&text).ok_or_else(|| {
            MeshError::LlmState(format!("no JSON payload found in model output: {}", text))
        })?;
        Ok(serde_json::from_value(value)?)
    }
}
