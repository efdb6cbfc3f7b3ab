//! Tool wrappers: the dispatch targets for inbound MCP calls.
//!
//! A wrapper marshals the inbound argument map into the tool's declared
//! parameters, injects the current dependency proxies and LLM agents from
//! its slot arrays, and invokes the user handler under a trace span with a
//! bounded timeout.
//!
//! Slot arrays are fixed-length at construction. Slots are written only by
//! the event processor and read only at dispatch; each slot is independently
//! atomic, so a reader sees either the old reference or the new one.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{MeshError, Result};
use crate::llm::{self, LlmAgent};
use crate::manifest::DependencySpec;
use crate::mcp_client::ReturnHint;
use crate::proxy::ToolProxy;
use crate::schema::{build_input_schema, ParamSpec};
use crate::trace::{self, Span, MESH_HEADERS_ARG, PARENT_SPAN_ARG, TRACE_ID_ARG};

/// Upper bound on one handler invocation.
const INVOCATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Boxed future returned by tool handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// User handler invoked per dispatch.
pub type ToolHandler = Arc<dyn Fn(ToolInvocation) -> HandlerFuture + Send + Sync>;

/// Everything a handler receives for one invocation.
///
/// Dependency and LLM slots may be `None` when unresolved - graceful
/// degradation is the handler's decision, not an automatic error.
pub struct ToolInvocation {
    args: Map<String, Value>,
    deps: Vec<Option<Arc<ToolProxy>>>,
    llms: Vec<Option<Arc<LlmAgent>>>,
}

impl ToolInvocation {
    /// Typed access to a required argument.
    pub fn arg<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self.args.get(name).cloned().ok_or_else(|| {
            MeshError::InvalidArgument(format!("missing required parameter '{}'", name))
        })?;
        serde_json::from_value(value).map_err(|e| {
            MeshError::InvalidArgument(format!("parameter '{}' has the wrong shape: {}", name, e))
        })
    }

    /// Typed access to an optional argument.
    pub fn opt_arg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.args.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                MeshError::InvalidArgument(format!(
                    "parameter '{}' has the wrong shape: {}",
                    name, e
                ))
            }),
        }
    }

    /// The converted argument map, trace keys already stripped.
    pub fn args(&self) -> &Map<String, Value> {
        &self.args
    }

    /// Dependency slot by declaration index.
    pub fn dep(&self, index: usize) -> Option<Arc<ToolProxy>> {
        self.deps.get(index).and_then(Clone::clone)
    }

    /// LLM slot by declaration index.
    pub fn llm(&self, index: usize) -> Option<Arc<LlmAgent>> {
        self.llms.get(index).and_then(Clone::clone)
    }
}

/// Dispatch wrapper for one registered tool.
pub struct ToolWrapper {
    function_id: String,
    method_name: String,
    capability: String,
    description: String,
    params: Vec<ParamSpec>,
    input_schema: Value,
    dep_specs: Vec<DependencySpec>,
    dep_hints: Vec<ReturnHint>,
    handler: ToolHandler,
    deps: Vec<RwLock<Option<Arc<ToolProxy>>>>,
    llms: Vec<RwLock<Option<Arc<LlmAgent>>>>,
}

impl ToolWrapper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        function_id: String,
        capability: String,
        description: String,
        params: Vec<ParamSpec>,
        dep_specs: Vec<DependencySpec>,
        dep_hints: Vec<ReturnHint>,
        llm_slots: usize,
        handler: ToolHandler,
    ) -> Self {
        let method_name = function_id
            .rsplit('.')
            .next()
            .unwrap_or(&function_id)
            .to_string();
        let input_schema = build_input_schema(&params);
        let dep_count = dep_specs.len();

        Self {
            function_id,
            method_name,
            capability,
            description,
            params,
            input_schema,
            dep_specs,
            dep_hints,
            handler,
            deps: (0..dep_count).map(|_| RwLock::new(None)).collect(),
            llms: (0..llm_slots).map(|_| RwLock::new(None)).collect(),
        }
    }

    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    pub fn dep_count(&self) -> usize {
        self.deps.len()
    }

    pub fn llm_count(&self) -> usize {
        self.llms.len()
    }

    pub fn dep_specs(&self) -> &[DependencySpec] {
        &self.dep_specs
    }

    /// Declared return-type hint for a dependency slot.
    pub fn dep_hint(&self, index: usize) -> ReturnHint {
        self.dep_hints.get(index).copied().unwrap_or_default()
    }

    /// Current proxy in a dependency slot.
    pub fn dep(&self, index: usize) -> Option<Arc<ToolProxy>> {
        self.deps
            .get(index)
            .and_then(|slot| slot.read().ok())
            .and_then(|slot| slot.clone())
    }

    /// Atomically replace a dependency slot.
    pub fn set_dep(&self, index: usize, proxy: Option<Arc<ToolProxy>>) {
        if let Some(slot) = self.deps.get(index) {
            if let Ok(mut slot) = slot.write() {
                *slot = proxy;
            }
        } else {
            warn!(
                "Dependency index {} out of range for '{}'",
                index, self.function_id
            );
        }
    }

    /// Current agent in an LLM slot.
    pub fn llm(&self, index: usize) -> Option<Arc<LlmAgent>> {
        self.llms
            .get(index)
            .and_then(|slot| slot.read().ok())
            .and_then(|slot| slot.clone())
    }

    /// Atomically replace an LLM slot.
    pub fn set_llm(&self, index: usize, agent: Option<Arc<LlmAgent>>) {
        if let Some(slot) = self.llms.get(index) {
            if let Ok(mut slot) = slot.write() {
                *slot = agent;
            }
        } else {
            warn!("LLM index {} out of range for '{}'", index, self.function_id);
        }
    }

    /// Write `agent` into every LLM slot (one agent per owning function id).
    pub fn set_llm_all(&self, agent: Arc<LlmAgent>) {
        for index in 0..self.llms.len() {
            self.set_llm(index, Some(agent.clone()));
        }
    }

    /// Handle one inbound MCP call.
    pub async fn invoke(&self, arguments: Value) -> Result<Value> {
        let mut map = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(MeshError::InvalidArgument(format!(
                    "arguments must be an object, got: {}",
                    other
                )))
            }
        };

        // Trace metadata rides in the argument map when the caller could not
        // inject headers; strip it before user code sees the arguments.
        // Arg-supplied ids win over inherited ones.
        let trace_id = take_string(&mut map, TRACE_ID_ARG);
        let parent_span = take_string(&mut map, PARENT_SPAN_ARG);
        trace::adopt_ids(trace_id, parent_span);

        if let Some(Value::Object(headers)) = map.remove(MESH_HEADERS_ARG) {
            let headers = headers
                .into_iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
                .collect();
            trace::merge_argument_headers(headers);
        }

        let mut span = Span::open(&self.function_id);
        span.set_metadata("capability", &self.capability);
        span.set_metadata("arg_count", map.len());

        let result = self.invoke_inner(map).await;

        match &result {
            Ok(_) => span.finish(None),
            Err(e) => span.finish(Some(&e.to_string())),
        }
        result
    }

    async fn invoke_inner(&self, map: Map<String, Value>) -> Result<Value> {
        let args = self.convert_arguments(map)?;

        let deps: Vec<Option<Arc<ToolProxy>>> = (0..self.deps.len()).map(|i| self.dep(i)).collect();
        let llms: Vec<Option<Arc<LlmAgent>>> = (0..self.llms.len()).map(|j| self.llm(j)).collect();

        let resolved = deps.iter().filter(|d| d.is_some()).count();
        if resolved < deps.len() {
            debug!(
                "'{}' dispatched with {}/{} dependencies resolved",
                self.function_id,
                resolved,
                deps.len()
            );
        }

        let context = Value::Object(args.clone());
        let invocation = ToolInvocation { args, deps, llms };

        let fut = (self.handler)(invocation);
        let guarded = llm::with_invocation_context(Some(context), async {
            tokio::time::timeout(INVOCATION_TIMEOUT, fut).await
        });

        match guarded.await {
            Ok(result) => result,
            Err(_) => Err(MeshError::Timeout(self.function_id.clone())),
        }
    }

    /// Convert the inbound map to the declared parameters.
    ///
    /// Unknown keys are dropped; required parameters must be present; typed
    /// parameters must match their declared schema type.
    fn convert_arguments(&self, mut map: Map<String, Value>) -> Result<Map<String, Value>> {
        let mut converted = Map::new();

        for param in &self.params {
            match map.remove(&param.name) {
                Some(value) => {
                    check_declared_type(&param.name, &value, &param.schema)?;
                    converted.insert(param.name.clone(), value);
                }
                None if param.required => {
                    return Err(MeshError::InvalidArgument(format!(
                        "missing required parameter '{}'",
                        param.name
                    )));
                }
                None => {}
            }
        }

        Ok(converted)
    }
}

impl std::fmt::Debug for ToolWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolWrapper")
            .field("function_id", &self.function_id)
            .field("capability", &self.capability)
            .field("deps", &self.deps.len())
            .field("llms", &self.llms.len())
            .finish()
    }
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key) {
        Some(Value::String(s)) => Some(s),
        Some(_) | None => None,
    }
}

/// Validate a value against the declared schema type.
///
/// Integers are accepted where numbers are declared; everything else must
/// match exactly. Null passes for optional-shaped values.
fn check_declared_type(name: &str, value: &Value, schema: &Value) -> Result<()> {
    let Some(declared) = schema.get("type").and_then(Value::as_str) else {
        return Ok(());
    };
    if value.is_null() {
        return Ok(());
    }

    let ok = match declared {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    };

    if ok {
        Ok(())
    } else {
        Err(MeshError::InvalidArgument(format!(
            "parameter '{}' must be of type {}, got: {}",
            name, declared, value
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_wrapper(params: Vec<ParamSpec>) -> ToolWrapper {
        ToolWrapper::new(
            "com.ex.Calc.add".to_string(),
            "add".to_string(),
            "Adds numbers".to_string(),
            params,
            vec![DependencySpec::new("mul")],
            vec![ReturnHint::Integer],
            0,
            Arc::new(|inv: ToolInvocation| {
                Box::pin(async move { Ok(Value::Object(inv.args().clone())) })
            }),
        )
    }

    #[test]
    fn test_method_name_from_function_id() {
        let wrapper = echo_wrapper(vec![]);
        assert_eq!(wrapper.method_name(), "add");
        assert_eq!(wrapper.function_id(), "com.ex.Calc.add");
    }

    #[test]
    fn test_schema_contains_only_exposed_params() {
        let wrapper = echo_wrapper(vec![
            ParamSpec::integer("a"),
            ParamSpec::integer("b").optional(),
        ]);
        let schema = wrapper.input_schema();
        let properties = schema["properties"].as_object().unwrap();
        assert_eq!(properties.len(), 2);
        assert_eq!(schema["required"], json!(["a"]));
        // Dependency slots never leak into the schema
        assert!(!properties.contains_key("mul"));
    }

    #[tokio::test]
    async fn test_missing_required_argument() {
        let wrapper = echo_wrapper(vec![ParamSpec::integer("a")]);
        let err = wrapper.invoke(json!({})).await.unwrap_err();
        assert!(matches!(err, MeshError::InvalidArgument(_)));
        assert!(err.to_string().contains("'a'"));
    }

    #[tokio::test]
    async fn test_type_mismatch_rejected() {
        let wrapper = echo_wrapper(vec![ParamSpec::integer("a")]);
        let err = wrapper.invoke(json!({"a": "two"})).await.unwrap_err();
        assert!(matches!(err, MeshError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_trace_args_stripped_before_user_code() {
        let wrapper = echo_wrapper(vec![ParamSpec::integer("x")]);
        let result = wrapper
            .invoke(json!({
                "_trace_id": "ab".repeat(16),
                "_parent_span": "12".repeat(8),
                "_mesh_headers": {"x-request-id": "r1"},
                "x": 1,
            }))
            .await
            .unwrap();

        assert_eq!(result, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_unknown_arguments_dropped() {
        let wrapper = echo_wrapper(vec![ParamSpec::integer("x")]);
        let result = wrapper.invoke(json!({"x": 1, "y": 2})).await.unwrap();
        assert_eq!(result, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_null_dependency_is_not_an_error() {
        let wrapper = ToolWrapper::new(
            "com.ex.Calc.add".to_string(),
            "add".to_string(),
            String::new(),
            vec![],
            vec![DependencySpec::new("mul")],
            vec![ReturnHint::Integer],
            0,
            Arc::new(|inv: ToolInvocation| {
                Box::pin(async move {
                    match inv.dep(0) {
                        Some(_) => Ok(json!({"used_dep": true})),
                        None => Ok(json!({"fallback": true})),
                    }
                })
            }),
        );

        let result = wrapper.invoke(json!({})).await.unwrap();
        assert_eq!(result, json!({"fallback": true}));
    }

    #[tokio::test]
    async fn test_slot_snapshot_visible_to_handler() {
        let wrapper = Arc::new(ToolWrapper::new(
            "com.ex.Calc.add".to_string(),
            "add".to_string(),
            String::new(),
            vec![],
            vec![DependencySpec::new("mul")],
            vec![ReturnHint::Integer],
            0,
            Arc::new(|inv: ToolInvocation| {
                Box::pin(async move {
                    let endpoint = inv.dep(0).map(|d| d.endpoint()).unwrap_or_default();
                    Ok(json!({"endpoint": endpoint}))
                })
            }),
        ));

        let factory = crate::proxy::ProxyFactory::new(Arc::new(crate::mcp_client::McpClient::new()));
        let proxy = factory.update("http://m:9000", "multiply", ReturnHint::Integer);
        wrapper.set_dep(0, Some(proxy));

        let result = wrapper.invoke(json!({})).await.unwrap();
        assert_eq!(result, json!({"endpoint": "http://m:9000"}));
    }

    #[tokio::test]
    async fn test_invocation_typed_args() {
        #[derive(serde::Deserialize)]
        struct Point {
            x: f64,
            y: f64,
        }

        let wrapper = ToolWrapper::new(
            "geo.norm".to_string(),
            "norm".to_string(),
            String::new(),
            vec![ParamSpec::object(
                "point",
                vec![ParamSpec::number("x"), ParamSpec::number("y")],
            )],
            vec![],
            vec![],
            0,
            Arc::new(|inv: ToolInvocation| {
                Box::pin(async move {
                    let point: Point = inv.arg("point")?;
                    Ok(json!(point.x.hypot(point.y)))
                })
            }),
        );

        let result = wrapper
            .invoke(json!({"point": {"x": 3.0, "y": 4.0}}))
            .await
            .unwrap();
        assert_eq!(result, json!(5.0));
    }
}
