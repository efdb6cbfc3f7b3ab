//! LLM agent proxies.
//!
//! An LLM agent runs an agentic loop against a remote LLM provider tool,
//! executing mesh tool calls the model requests and feeding results back
//! until the model answers in text. Tool failures are returned to the model
//! as structured JSON so it can self-correct; the loop only errors when the
//! provider itself is unusable.
//!
//! An agent may exist with tools but no provider (callable state =
//! unavailable); learning the provider later never replaces the reference.

pub mod extract;
pub mod request;
pub mod template;

use std::cell::RefCell;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::error::{MeshError, Result};
use crate::events::LlmToolInfo;
use crate::manifest::LlmBinding;
use crate::mcp_client::{McpClient, ReturnHint};
use crate::proxy::ProxyFactory;

pub use request::{ChatMessage, ContextMode, GenerateRequest, ModelParams};

/// Dispatch seam for tool calls that target the current agent's own tools.
///
/// Local dispatch skips the HTTP hop. Held weakly: the dispatcher owns the
/// wrappers that own this agent, so the back-reference must not own.
#[async_trait]
pub trait LocalToolDispatch: Send + Sync {
    /// The local agent id, used to recognize self-targeted calls.
    fn agent_id(&self) -> String;

    /// Invoke a local tool by function or capability name.
    async fn dispatch_local(&self, name: &str, arguments: Value) -> Result<Value>;
}

tokio::task_local! {
    static INVOCATION_CONTEXT: RefCell<Option<Value>>;
}

/// Run `fut` with the given exposed-argument map as the LLM invocation
/// context.
///
/// The tool wrapper scopes every handler invocation; `generate()` reads its
/// context parameter out of this map when rendering templates.
pub async fn with_invocation_context<F, T>(context: Option<Value>, fut: F) -> T
where
    F: Future<Output = T>,
{
    INVOCATION_CONTEXT.scope(RefCell::new(context), fut).await
}

fn current_invocation_context() -> Option<Value> {
    INVOCATION_CONTEXT
        .try_with(|cell| cell.borrow().clone())
        .ok()
        .flatten()
}

/// Resolved provider endpoint for an LLM agent.
#[derive(Debug, Clone)]
pub struct ProviderBinding {
    pub endpoint: String,
    pub function_name: String,
    pub model: Option<String>,
}

/// Proxy that drives the agentic loop for one LLM-bound function.
pub struct LlmAgent {
    function_id: String,
    provider_configured: bool,
    provider: RwLock<Option<ProviderBinding>>,
    tools: RwLock<Arc<Vec<LlmToolInfo>>>,
    system_prompt: Option<String>,
    context_param: Option<String>,
    defaults: ModelParams,
    max_iterations: u32,
    client: Arc<McpClient>,
    factory: Arc<ProxyFactory>,
    local: RwLock<Option<Weak<dyn LocalToolDispatch>>>,
}

impl LlmAgent {
    /// Build an agent from its binding configuration.
    pub fn from_binding(
        function_id: impl Into<String>,
        binding: &LlmBinding,
        factory: Arc<ProxyFactory>,
    ) -> Self {
        Self {
            function_id: function_id.into(),
            provider_configured: !binding.provider.capability.is_empty(),
            provider: RwLock::new(None),
            tools: RwLock::new(Arc::new(Vec::new())),
            system_prompt: binding.system_prompt.clone(),
            context_param: binding.context_param.clone(),
            defaults: ModelParams {
                max_tokens: binding.max_tokens,
                temperature: binding.temperature,
                top_p: binding.top_p,
                stop: binding.stop.clone(),
            },
            max_iterations: binding.max_iterations.max(1),
            client: factory.client(),
            factory,
            local: RwLock::new(None),
        }
    }

    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    /// Whether the provider is bound to a live endpoint.
    pub fn is_available(&self) -> bool {
        self.provider
            .read()
            .map(|p| p.as_ref().is_some_and(|b| !b.endpoint.is_empty()))
            .unwrap_or(false)
    }

    /// Current tool list snapshot.
    pub fn tools(&self) -> Arc<Vec<LlmToolInfo>> {
        self.tools
            .read()
            .map(|t| t.clone())
            .unwrap_or_else(|_| Arc::new(Vec::new()))
    }

    /// Replace the tool list (copy-on-write swap).
    pub fn set_tools(&self, tools: Vec<LlmToolInfo>) {
        if let Ok(mut current) = self.tools.write() {
            debug!(
                "LLM agent '{}' tools updated: {} tools",
                self.function_id,
                tools.len()
            );
            *current = Arc::new(tools);
        }
    }

    /// Bind or re-point the provider endpoint.
    ///
    /// Valid before or after tools are learned; never destroys the agent.
    pub fn set_provider(&self, binding: ProviderBinding) {
        if let Ok(mut current) = self.provider.write() {
            debug!(
                "LLM agent '{}' provider '{}' at {}",
                self.function_id, binding.function_name, binding.endpoint
            );
            *current = Some(binding);
        }
    }

    /// Wire the local dispatch seam for self-targeted tool calls.
    pub fn set_local_dispatch(&self, dispatch: Weak<dyn LocalToolDispatch>) {
        if let Ok(mut current) = self.local.write() {
            *current = Some(dispatch);
        }
    }

    /// Start a fluent generation request.
    pub fn request(&self) -> GenerateRequest<'_> {
        GenerateRequest::new(self)
    }

    /// Convenience: single user message, default parameters.
    pub async fn generate(&self, prompt: impl Into<String>) -> Result<String> {
        self.request().user(prompt).generate().await
    }

    fn provider_binding(&self) -> Result<ProviderBinding> {
        let binding = self
            .provider
            .read()
            .ok()
            .and_then(|p| p.clone())
            .filter(|b| !b.endpoint.is_empty());
        if let Some(binding) = binding {
            return Ok(binding);
        }
        // A resolved provider trumps configuration state; with neither, the
        // error says whether binding one was ever possible.
        if self.provider_configured {
            Err(MeshError::LlmState(format!(
                "LLM provider for '{}' is not available",
                self.function_id
            )))
        } else {
            Err(MeshError::LlmState(format!(
                "no LLM provider configured for '{}'",
                self.function_id
            )))
        }
    }

    /// Effective template context from the invocation-scoped argument map.
    fn auto_context(&self) -> Map<String, Value> {
        let Some(param) = &self.context_param else {
            return Map::new();
        };
        let Some(args) = current_invocation_context() else {
            return Map::new();
        };
        match args.get(param) {
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                let mut map = Map::new();
                map.insert(param.clone(), other.clone());
                map
            }
            None => Map::new(),
        }
    }

    /// Merge auto-injected and per-request context per the request's mode.
    fn effective_context(&self, request: &GenerateRequest<'_>) -> Map<String, Value> {
        match request.context_mode {
            ContextMode::Replace => request.context.clone(),
            ContextMode::Append => {
                let mut merged = self.auto_context();
                for (k, v) in &request.context {
                    merged.insert(k.clone(), v.clone());
                }
                merged
            }
            ContextMode::Prepend => {
                let mut merged = request.context.clone();
                for (k, v) in self.auto_context() {
                    merged.insert(k, v);
                }
                merged
            }
        }
    }

    /// Compose the outgoing message list.
    ///
    /// An explicit system message suppresses the configured template.
    fn compose_messages(&self, request: &GenerateRequest<'_>) -> Vec<ChatMessage> {
        let mut messages = Vec::new();

        let has_explicit_system = request.messages.iter().any(ChatMessage::is_system);
        if !has_explicit_system {
            if let Some(template) = &self.system_prompt {
                let rendered = if template::contains_directives(template) {
                    let mut context = self.effective_context(request);
                    let tools: Vec<Value> = self
                        .tools()
                        .iter()
                        .map(|t| {
                            json!({
                                "name": t.function_name,
                                "description": t.description.clone().unwrap_or_default(),
                                "capability": t.capability,
                            })
                        })
                        .collect();
                    context.insert("tools".to_string(), Value::Array(tools));
                    template::render(template, &context)
                } else {
                    template.clone()
                };
                messages.push(ChatMessage::new("system", rendered));
            }
        }

        messages.extend(request.messages.iter().cloned());
        messages
    }

    /// Tool definitions in function-call form.
    fn tool_definitions(&self) -> Vec<Value> {
        self.tools()
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.function_name,
                        "description": t.description.clone().unwrap_or_default(),
                        "parameters": t.input_schema.clone().unwrap_or_else(
                            || json!({"type": "object", "properties": {}})
                        ),
                    }
                })
            })
            .collect()
    }

    /// Run the agentic loop for a composed request.
    pub(crate) async fn run_loop(&self, request: GenerateRequest<'_>) -> Result<String> {
        let binding = self.provider_binding()?;
        let max_iterations = request.max_iterations.unwrap_or(self.max_iterations).max(1);

        let mut messages = self.compose_messages(&request);
        let tool_definitions = self.tool_definitions();
        let mut model_params = request.params.merged_with(&self.defaults).to_map();
        if let Some((type_name, schema)) = &request.response_schema {
            model_params.insert("output_schema".to_string(), schema.clone());
            model_params.insert(
                "output_type_name".to_string(),
                Value::String(type_name.clone()),
            );
        }

        let mut unavailable: HashSet<String> = HashSet::new();
        let mut last_content = String::new();

        for iteration in 0..max_iterations {
            let provider_request = json!({
                "request": {
                    "messages": &messages,
                    "tools": &tool_definitions,
                    "model_params": &model_params,
                }
            });

            let response = self
                .client
                .call_tool(
                    &binding.endpoint,
                    &binding.function_name,
                    provider_request,
                    ReturnHint::Json,
                )
                .await?;

            let assistant = AssistantTurn::from_response(response);
            if !assistant.content.is_empty() {
                last_content = assistant.content.clone();
            }

            let Some(tool_calls) = assistant.tool_calls.clone() else {
                return Ok(assistant.content);
            };
            if tool_calls.is_empty() {
                return Ok(assistant.content);
            }

            debug!(
                "LLM agent '{}' iteration {}: {} tool call(s)",
                self.function_id,
                iteration + 1,
                tool_calls.len()
            );

            messages.push(ChatMessage::assistant_with_tool_calls(
                Value::String(assistant.content.clone()),
                Value::Array(tool_calls.clone()),
            ));

            for call in &tool_calls {
                let outcome = self.execute_tool_call(call, &mut unavailable).await;
                messages.push(outcome);
            }
        }

        warn!(
            "LLM agent '{}' exhausted {} iterations",
            self.function_id, max_iterations
        );
        Ok(last_content)
    }

    /// Execute one tool call and shape the tool-role reply.
    ///
    /// Every failure becomes a JSON error message for the model; nothing is
    /// thrown out of the loop from here.
    async fn execute_tool_call(
        &self,
        call: &Value,
        unavailable: &mut HashSet<String>,
    ) -> ChatMessage {
        let call_id = call
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string);

        let name = call
            .get("function")
            .and_then(|f| f.get("name"))
            .or_else(|| call.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if name.is_empty() {
            let err = MeshError::InvalidArgument("tool call without a name".to_string());
            return ChatMessage::tool_result(call_id, err.to_llm_json("").to_string());
        }

        let arguments = match parse_call_arguments(call) {
            Ok(arguments) => arguments,
            Err(err) => {
                return ChatMessage::tool_result(call_id, err.to_llm_json(&name).to_string());
            }
        };

        if unavailable.contains(&name) {
            let err = MeshError::ToolUnavailable(name.clone());
            return ChatMessage::tool_result(call_id, err.to_llm_json(&name).to_string());
        }

        let result = self.dispatch_tool(&name, arguments).await;
        match result {
            Ok(value) => {
                let content = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                ChatMessage::tool_result(call_id, content)
            }
            Err(err) => {
                if matches!(err, MeshError::ToolUnavailable(_)) {
                    unavailable.insert(name.clone());
                }
                ChatMessage::tool_result(call_id, err.to_llm_json(&name).to_string())
            }
        }
    }

    /// Route a tool call locally when it targets our own agent, remotely
    /// otherwise.
    async fn dispatch_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let tool = self
            .tools()
            .iter()
            .find(|t| t.function_name == name || t.capability == name)
            .cloned()
            .ok_or_else(|| MeshError::ToolCallFailed {
                function: name.to_string(),
                message: "tool is not in the advertised tool list".to_string(),
            })?;

        let local = self
            .local
            .read()
            .ok()
            .and_then(|l| l.clone())
            .and_then(|weak| weak.upgrade());

        if let Some(local) = local {
            if tool.agent_id == local.agent_id() {
                debug!("Dispatching tool '{}' locally", name);
                return local.dispatch_local(&tool.function_name, arguments).await;
            }
        }

        if tool.endpoint.is_empty() {
            return Err(MeshError::ToolUnavailable(name.to_string()));
        }

        let proxy = self
            .factory
            .update(&tool.endpoint, &tool.function_name, ReturnHint::Json);
        proxy.call_map(arguments).await
    }
}

impl std::fmt::Debug for LlmAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmAgent")
            .field("function_id", &self.function_id)
            .field("available", &self.is_available())
            .field("tools", &self.tools().len())
            .finish()
    }
}

/// The assistant message parsed out of a provider response.
struct AssistantTurn {
    content: String,
    tool_calls: Option<Vec<Value>>,
}

impl AssistantTurn {
    /// Accepts either an OpenAI-style assistant message with optional
    /// `tool_calls`, or an Anthropic-style structure whose first content
    /// block's text encodes `{content, tool_calls}` as JSON.
    fn from_response(response: Value) -> Self {
        // Top-level tool_calls (OpenAI shape)
        if let Some(calls) = response.get("tool_calls").and_then(Value::as_array) {
            return Self {
                content: text_content(&response),
                tool_calls: Some(calls.clone()),
            };
        }

        // Nested shape: the textual content itself parses as an object
        // carrying tool_calls
        let content = text_content(&response);
        if let Ok(inner) = serde_json::from_str::<Value>(&content) {
            if let Some(obj) = inner.as_object() {
                if let Some(calls) = obj.get("tool_calls").and_then(Value::as_array) {
                    let inner_content = obj
                        .get("content")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    return Self {
                        content: inner_content,
                        tool_calls: Some(calls.clone()),
                    };
                }
                // `{content: …}` wrapper with no tool calls unwraps
                // transparently
                if let Some(Value::String(s)) = obj.get("content") {
                    return Self {
                        content: s.clone(),
                        tool_calls: None,
                    };
                }
            }
        }

        Self {
            content,
            tool_calls: None,
        }
    }
}

/// Textual content of a provider response in any supported shape.
fn text_content(response: &Value) -> String {
    match response {
        Value::String(s) => s.clone(),
        Value::Object(obj) => match obj.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(blocks)) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        },
        _ => String::new(),
    }
}

/// Parse tool-call arguments: a JSON string (OpenAI `function.arguments`) or
/// a pre-parsed object (Anthropic `input`). Anything else is an invalid
/// argument, never guessed as empty.
fn parse_call_arguments(call: &Value) -> Result<Value> {
    let raw = call
        .get("function")
        .and_then(|f| f.get("arguments"))
        .or_else(|| call.get("arguments"))
        .or_else(|| call.get("input"));

    match raw {
        Some(Value::String(s)) => {
            let parsed: Value = serde_json::from_str(s).map_err(|e| {
                MeshError::InvalidArgument(format!("tool call arguments are not JSON: {}", e))
            })?;
            match parsed {
                Value::Object(_) => Ok(parsed),
                other => Err(MeshError::InvalidArgument(format!(
                    "tool call arguments must be an object, got: {}",
                    other
                ))),
            }
        }
        Some(Value::Object(map)) => Ok(Value::Object(map.clone())),
        Some(other) => Err(MeshError::InvalidArgument(format!(
            "unsupported tool call argument shape: {}",
            other
        ))),
        None => Err(MeshError::InvalidArgument(
            "tool call carries no arguments".to_string(),
        )),
    }
}
