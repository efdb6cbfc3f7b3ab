//! HTTP surface of the agent: MCP endpoint, metadata, and health probe.
//!
//! `POST /mcp` dispatches JSON-RPC `tools/call` and `tools/list` through the
//! wrapper registry. Every request runs inside a fresh trace scope seeded
//! from `X-Trace-ID` / `X-Parent-Span` and the configured propagation
//! headers, so context can never leak between requests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{MeshError, Result};
use crate::manifest::AgentManifest;
use crate::trace::{self, TraceContext, PARENT_SPAN_HEADER, TRACE_ID_HEADER};
use crate::wrappers::WrapperRegistry;

/// Shared state behind the HTTP routes.
#[derive(Clone)]
pub struct ServerState {
    pub registry: Arc<WrapperRegistry>,
    pub manifest: Arc<AgentManifest>,
    pub running: Arc<AtomicBool>,
    /// Header names captured at the boundary and forwarded on outbound
    /// calls
    pub propagation_headers: Arc<Vec<String>>,
}

/// A running HTTP server.
pub struct AgentServer {
    pub addr: SocketAddr,
    join: JoinHandle<()>,
}

impl AgentServer {
    /// Bind and serve. Port 0 binds an ephemeral port; the actual address
    /// is reported back for registration.
    ///
    /// Always binds all interfaces; `host` is only what gets announced to
    /// the registry.
    pub async fn start(state: ServerState, host: &str, port: u16) -> Result<Self> {
        let app = router(state);
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| MeshError::Registration(format!("failed to bind {}:{}: {}", host, port, e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| MeshError::Registration(format!("failed to read bound address: {}", e)))?;

        info!("MCP server listening on {}", addr);
        let join = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("HTTP server stopped with error: {}", e);
            }
        });

        Ok(Self { addr, join })
    }

    /// Stop serving.
    pub fn stop(self) {
        self.join.abort();
    }
}

/// Build the router.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/mcp", post(handle_mcp))
        .route("/metadata", get(handle_metadata))
        .route("/health", get(handle_health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

async fn handle_mcp(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let request: JsonRpcRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            return Json(json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": {"code": -32700, "message": format!("parse error: {}", e)},
            }));
        }
    };
    let id = request.id.clone().unwrap_or(Value::Null);

    // Fresh scope per request: inherited context is discarded, ids come
    // from headers when present, and the configured propagation headers are
    // captured for outbound calls.
    let seed = seed_from_headers(&headers, &state.propagation_headers);
    let result = trace::scope(seed, dispatch(state, request)).await;

    match result {
        Ok(result) => Json(json!({"jsonrpc": "2.0", "id": id, "result": result})),
        Err(e) => Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": e.json_rpc_code(), "message": e.to_string()},
        })),
    }
}

fn seed_from_headers(headers: &HeaderMap, propagation: &[String]) -> TraceContext {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    let mut captured = HashMap::new();
    for name in propagation {
        if let Some(value) = header_value(name) {
            captured.insert(name.clone(), value);
        }
    }

    TraceContext {
        trace_id: header_value(TRACE_ID_HEADER),
        parent_span: header_value(PARENT_SPAN_HEADER),
        headers: captured,
    }
}

async fn dispatch(state: ServerState, request: JsonRpcRequest) -> Result<Value> {
    match request.method.as_str() {
        "tools/list" => Ok(state.registry.tool_listing()),
        "tools/call" => {
            let name = request
                .params
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    MeshError::InvalidArgument("params.name is required".to_string())
                })?;
            let arguments = request
                .params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new()));

            let handler = state.registry.handler(name).ok_or_else(|| {
                MeshError::InvalidArgument(format!("unknown tool '{}'", name))
            })?;

            debug!("Dispatching tool '{}'", name);
            let result = handler.invoke(arguments).await?;

            // Results ride as textual content so any JSON value round-trips
            let text = serde_json::to_string(&result)?;
            Ok(json!({"content": [{"text": text}]}))
        }
        other => Err(MeshError::InvalidArgument(format!(
            "unsupported method '{}'",
            other
        ))),
    }
}

async fn handle_metadata(State(state): State<ServerState>) -> Json<Value> {
    let mut capabilities = Map::new();
    for spec in state.manifest.tools.iter().filter(|t| !t.route_only) {
        capabilities.insert(
            spec.capability.clone(),
            json!({
                "function_name": spec.function_name,
                "capability": spec.capability,
                "session_required": false,
                "stateful": false,
                "streaming": false,
                "full_mcp_access": false,
                "version": spec.version,
                "tags": spec.tags,
                "description": spec.description,
                "custom_metadata": {},
            }),
        );
    }

    Json(json!({
        "agent_id": state.manifest.agent_id,
        "capabilities": capabilities,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn handle_health(State(state): State<ServerState>) -> impl IntoResponse {
    if state.running.load(Ordering::SeqCst) {
        (
            StatusCode::OK,
            Json(json!({"status": "healthy", "agent": state.manifest.name})),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unavailable", "agent": state.manifest.name})),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ToolSpec;
    use crate::mcp_client::McpClient;
    use crate::proxy::ProxyFactory;
    use crate::schema::ParamSpec;
    use crate::wrapper::{ToolInvocation, ToolWrapper};

    fn test_state() -> ServerState {
        let registry = Arc::new(WrapperRegistry::new(Arc::new(ProxyFactory::new(Arc::new(
            McpClient::new(),
        )))));
        registry.register(
            Arc::new(ToolWrapper::new(
                "calc.add".to_string(),
                "calc-add".to_string(),
                "Adds".to_string(),
                vec![ParamSpec::integer("a"), ParamSpec::integer("b")],
                vec![],
                vec![],
                0,
                Arc::new(|inv: ToolInvocation| {
                    Box::pin(async move {
                        let a: i64 = inv.arg("a")?;
                        let b: i64 = inv.arg("b")?;
                        Ok(json!(a + b))
                    })
                }),
            )),
            true,
        );

        let manifest = AgentManifest {
            name: "calc".to_string(),
            agent_id: "calc-1a2b3c4d".to_string(),
            version: "1.0.0".to_string(),
            description: String::new(),
            registry_url: "http://localhost:8000".to_string(),
            http_host: "localhost".to_string(),
            http_port: 0,
            namespace: "default".to_string(),
            heartbeat_interval: 5,
            tools: vec![ToolSpec {
                function_id: "calc.add".to_string(),
                function_name: "add".to_string(),
                capability: "calc-add".to_string(),
                version: "1.0.0".to_string(),
                tags: vec!["math".to_string()],
                description: "Adds".to_string(),
                dependencies: Vec::new(),
                input_schema: None,
                llm_bindings: Vec::new(),
                route_only: false,
            }],
        };

        ServerState {
            registry,
            manifest: Arc::new(manifest),
            running: Arc::new(AtomicBool::new(true)),
            propagation_headers: Arc::new(vec!["x-request-id".to_string()]),
        }
    }

    async fn start_test_server() -> (AgentServer, String, ServerState) {
        let state = test_state();
        let server = AgentServer::start(state.clone(), "localhost", 0)
            .await
            .unwrap();
        let url = format!("http://127.0.0.1:{}", server.addr.port());
        (server, url, state)
    }

    #[tokio::test]
    async fn test_tools_call_round_trip() {
        let (_server, url, _state) = start_test_server().await;
        let client = reqwest::Client::new();

        let response: Value = client
            .post(format!("{}/mcp", url))
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "tools/call",
                "params": {"name": "calc-add", "arguments": {"a": 2, "b": 3}},
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(response["id"], json!(7));
        assert_eq!(response["result"]["content"][0]["text"], "5");
    }

    #[tokio::test]
    async fn test_tools_call_missing_argument() {
        let (_server, url, _state) = start_test_server().await;
        let client = reqwest::Client::new();

        let response: Value = client
            .post(format!("{}/mcp", url))
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "tools/call",
                "params": {"name": "calc-add", "arguments": {"a": 2}},
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(response["error"]["code"], json!(-32602));
        assert!(response["error"]["message"]
            .as_str()
            .unwrap()
            .contains("'b'"));
    }

    #[tokio::test]
    async fn test_tools_list() {
        let (_server, url, _state) = start_test_server().await;
        let client = reqwest::Client::new();

        let response: Value = client
            .post(format!("{}/mcp", url))
            .json(&json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list", "params": {}}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        let tools = response["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "calc-add");
        assert!(tools[0]["inputSchema"]["properties"]["a"].is_object());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (_server, url, _state) = start_test_server().await;
        let client = reqwest::Client::new();

        let response: Value = client
            .post(format!("{}/mcp", url))
            .json(&json!({"jsonrpc": "2.0", "id": 3, "method": "resources/list", "params": {}}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert!(response["error"]["message"]
            .as_str()
            .unwrap()
            .contains("resources/list"));
    }

    #[tokio::test]
    async fn test_metadata() {
        let (_server, url, _state) = start_test_server().await;

        let response: Value = reqwest::get(format!("{}/metadata", url))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(response["agent_id"], "calc-1a2b3c4d");
        let capability = &response["capabilities"]["calc-add"];
        assert_eq!(capability["function_name"], "add");
        assert_eq!(capability["session_required"], json!(false));
        assert_eq!(capability["tags"], json!(["math"]));
        assert!(response["timestamp"].as_str().unwrap().contains('T'));
    }

    #[tokio::test]
    async fn test_health_reflects_running_flag() {
        let (_server, url, state) = start_test_server().await;
        let client = reqwest::Client::new();

        let response = client.get(format!("{}/health", url)).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["agent"], "calc");

        state.running.store(false, Ordering::SeqCst);
        let response = client.get(format!("{}/health", url)).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 503);

        // HEAD returns the status code with no body
        let response = client.head(format!("{}/health", url)).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 503);
    }

    #[tokio::test]
    async fn test_trace_headers_seed_scope() {
        let (_server, url, _state) = start_test_server().await;
        let client = reqwest::Client::new();

        // The call succeeds with trace headers attached; span wiring is
        // covered in trace tests, here we prove the boundary accepts them
        let response: Value = client
            .post(format!("{}/mcp", url))
            .header("X-Trace-ID", "ab".repeat(16))
            .header("X-Parent-Span", "12".repeat(8))
            .header("x-request-id", "req-1")
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 4,
                "method": "tools/call",
                "params": {"name": "calc-add", "arguments": {"a": 1, "b": 1}},
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(response["result"]["content"][0]["text"], "2");
    }
}
