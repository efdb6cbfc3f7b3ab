//! HTTP client for peer MCP endpoints.
//!
//! Issues JSON-RPC 2.0 `tools/call` and `tools/list` requests to
//! `<endpoint>/mcp`. Peers may answer with plain JSON or SSE framing; SSE
//! bodies are flattened over their `data:` lines before parsing.
//!
//! The client never retries - callers (the agentic loop, user code) decide
//! what a failure means.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use reqwest::header::ACCEPT;
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::error::{MeshError, Result};

/// Connect timeout for peer calls.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Total request timeout (covers read and write).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Expected return type for a remote call.
///
/// Primitive hints short-cut deserialization of the textual content; `Json`
/// parses generically and falls back to the raw string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnHint {
    String,
    Integer,
    Double,
    Boolean,
    #[default]
    Json,
}

/// Monotonic JSON-RPC request id, unique per process.
static NEXT_ID: AtomicI64 = AtomicI64::new(1);

fn next_request_id() -> i64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// JSON-RPC client for peer MCP servers.
pub struct McpClient {
    client: reqwest::Client,
}

impl Default for McpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl McpClient {
    /// Create a client with the standard peer timeouts.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self { client }
    }

    /// Issue a `tools/call` request and extract the typed result.
    pub async fn call_tool(
        &self,
        endpoint: &str,
        function_name: &str,
        arguments: Value,
        hint: ReturnHint,
    ) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": next_request_id(),
            "method": "tools/call",
            "params": {
                "name": function_name,
                "arguments": arguments,
            },
        });

        let result = self.post(endpoint, function_name, body).await?;
        extract_result(result, function_name, hint)
    }

    /// Issue a `tools/list` request.
    pub async fn list_tools(&self, endpoint: &str) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": next_request_id(),
            "method": "tools/list",
            "params": {},
        });

        self.post(endpoint, "tools/list", body).await
    }

    /// POST the request and return the JSON-RPC `result` node.
    async fn post(&self, endpoint: &str, function_name: &str, body: Value) -> Result<Value> {
        let url = mcp_url(endpoint)?;
        trace!("MCP request to {}: {}", url, body);

        let response = self
            .client
            .post(&url)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| MeshError::ToolCallFailed {
                function: function_name.to_string(),
                message: format!("request to {} failed: {}", url, e),
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| MeshError::ToolCallFailed {
                function: function_name.to_string(),
                message: format!("failed to read response body: {}", e),
            })?;

        if !status.is_success() {
            return Err(MeshError::ToolCallFailed {
                function: function_name.to_string(),
                message: format!("HTTP {} from {}: {}", status.as_u16(), url, text),
            });
        }

        if text.trim().is_empty() {
            return Err(MeshError::ToolCallFailed {
                function: function_name.to_string(),
                message: format!("empty response body from {}", url),
            });
        }

        let envelope = parse_body(&text).map_err(|e| MeshError::ToolCallFailed {
            function: function_name.to_string(),
            message: format!("unparseable response from {}: {}", url, e),
        })?;

        if let Some(error) = envelope.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown JSON-RPC error");
            return Err(MeshError::ToolCallFailed {
                function: function_name.to_string(),
                message: message.to_string(),
            });
        }

        debug!("MCP call '{}' succeeded", function_name);
        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }
}

/// Build the peer URL: endpoint + `/mcp`, exactly once.
///
/// An endpoint with no trailing path gets `/mcp`; one that already carries
/// the suffix is used as-is. Empty endpoints are an error, never a default.
fn mcp_url(endpoint: &str) -> Result<String> {
    let trimmed = endpoint.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(MeshError::ToolCallFailed {
            function: String::new(),
            message: "empty endpoint".to_string(),
        });
    }
    if trimmed.ends_with("/mcp") {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{}/mcp", trimmed))
    }
}

/// Parse a response body that may be JSON or SSE-framed.
///
/// SSE bodies concatenate every `data:` payload in order and parse the
/// concatenation as JSON.
fn parse_body(body: &str) -> serde_json::Result<Value> {
    let trimmed = body.trim_start();
    let looks_sse = trimmed.starts_with("event:")
        || trimmed.starts_with("data:")
        || body.contains("\ndata:");

    if looks_sse {
        let mut data = String::new();
        for line in body.lines() {
            if let Some(payload) = line.strip_prefix("data:") {
                data.push_str(payload.trim_start());
            }
        }
        serde_json::from_str(&data)
    } else {
        serde_json::from_str(body)
    }
}

/// Extract the call result from the JSON-RPC `result` node.
///
/// `result.content[0].text` is preferred when present; the hint drives a
/// typed parse of that text. Without textual content the result node itself
/// is interpreted under the hint.
fn extract_result(result: Value, function_name: &str, hint: ReturnHint) -> Result<Value> {
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|content| content.first())
        .and_then(|block| block.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string);

    match text {
        Some(text) => decode_text(&text, function_name, hint),
        None => coerce_node(result, function_name, hint),
    }
}

/// Decode textual content under a return-type hint.
fn decode_text(text: &str, function_name: &str, hint: ReturnHint) -> Result<Value> {
    let typed_err = |expected: &str| MeshError::ToolCallFailed {
        function: function_name.to_string(),
        message: format!("expected {} result, got: {}", expected, text),
    };

    match hint {
        ReturnHint::Integer => serde_json::from_str::<i64>(text.trim())
            .map(Value::from)
            .map_err(|_| typed_err("integer")),
        ReturnHint::Double => serde_json::from_str::<f64>(text.trim())
            .map(Value::from)
            .map_err(|_| typed_err("number")),
        ReturnHint::Boolean => serde_json::from_str::<bool>(text.trim())
            .map(Value::from)
            .map_err(|_| typed_err("boolean")),
        ReturnHint::String => {
            // JSON-encoded strings round-trip; anything else is kept raw
            match serde_json::from_str::<Value>(text) {
                Ok(Value::String(s)) => Ok(Value::String(s)),
                _ => Ok(Value::String(text.to_string())),
            }
        }
        ReturnHint::Json => Ok(serde_json::from_str::<Value>(text)
            .unwrap_or_else(|_| Value::String(text.to_string()))),
    }
}

/// Interpret a non-textual result node under a hint.
fn coerce_node(node: Value, function_name: &str, hint: ReturnHint) -> Result<Value> {
    let mismatch = |expected: &str, node: &Value| MeshError::ToolCallFailed {
        function: function_name.to_string(),
        message: format!("expected {} result, got: {}", expected, node),
    };

    match hint {
        ReturnHint::Integer if node.is_i64() || node.is_u64() => Ok(node),
        ReturnHint::Integer => Err(mismatch("integer", &node)),
        ReturnHint::Double if node.is_number() => Ok(node),
        ReturnHint::Double => Err(mismatch("number", &node)),
        ReturnHint::Boolean if node.is_boolean() => Ok(node),
        ReturnHint::Boolean => Err(mismatch("boolean", &node)),
        ReturnHint::String => match node {
            Value::String(s) => Ok(Value::String(s)),
            other => Ok(Value::String(other.to_string())),
        },
        ReturnHint::Json => Ok(node),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mcp_url() {
        assert_eq!(mcp_url("http://m:9000").unwrap(), "http://m:9000/mcp");
        assert_eq!(mcp_url("http://m:9000/").unwrap(), "http://m:9000/mcp");
        assert_eq!(mcp_url("http://m:9000/mcp").unwrap(), "http://m:9000/mcp");
        assert!(mcp_url("").is_err());
    }

    #[test]
    fn test_parse_body_plain_json() {
        let v = parse_body(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
    }

    #[test]
    fn test_parse_body_sse() {
        let body = "event: message\nid: 1\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"content\":[{\"text\":\"\\\"ok\\\"\"}]}}\n\n";
        let v = parse_body(body).unwrap();
        assert_eq!(v["result"]["content"][0]["text"], "\"ok\"");
    }

    #[test]
    fn test_parse_body_sse_multiple_data_lines() {
        let body = "data: {\"jsonrpc\":\"2.0\",\ndata: \"id\":1,\"result\":{}}\n";
        let v = parse_body(body).unwrap();
        assert_eq!(v["id"], 1);
    }

    #[test]
    fn test_decode_text_integer() {
        let v = decode_text("6", "multiply", ReturnHint::Integer).unwrap();
        assert_eq!(v, json!(6));
        assert!(decode_text("not-a-number", "multiply", ReturnHint::Integer).is_err());
    }

    #[test]
    fn test_decode_text_string_unwraps_json_string() {
        let v = decode_text("\"ok\"", "f", ReturnHint::String).unwrap();
        assert_eq!(v, json!("ok"));

        let v = decode_text("plain text", "f", ReturnHint::String).unwrap();
        assert_eq!(v, json!("plain text"));
    }

    #[test]
    fn test_decode_text_json_falls_back_to_raw() {
        let v = decode_text(r#"{"a":1}"#, "f", ReturnHint::Json).unwrap();
        assert_eq!(v, json!({"a": 1}));

        let v = decode_text("not json {", "f", ReturnHint::Json).unwrap();
        assert_eq!(v, json!("not json {"));
    }

    #[test]
    fn test_extract_result_without_content() {
        let v = extract_result(json!({"value": 42}), "f", ReturnHint::Json).unwrap();
        assert_eq!(v, json!({"value": 42}));

        let v = extract_result(json!(true), "f", ReturnHint::Boolean).unwrap();
        assert_eq!(v, json!(true));
    }

    #[tokio::test]
    async fn test_call_tool_round_trip() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/mcp")
            .match_header("accept", "application/json, text/event-stream")
            .with_status(200)
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":{"content":[{"text":"6"}]}}"#)
            .create_async()
            .await;

        let client = McpClient::new();
        let result = client
            .call_tool(
                &server.url(),
                "multiply",
                json!({"x": 2, "y": 3}),
                ReturnHint::Integer,
            )
            .await
            .unwrap();

        assert_eq!(result, json!(6));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_call_tool_sse_response() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/mcp")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(
                "event: message\nid: 1\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"content\":[{\"text\":\"\\\"ok\\\"\"}]}}\n\n",
            )
            .create_async()
            .await;

        let client = McpClient::new();
        let result = client
            .call_tool(&server.url(), "status", json!({}), ReturnHint::String)
            .await
            .unwrap();

        assert_eq!(result, json!("ok"));
    }

    #[tokio::test]
    async fn test_call_tool_json_rpc_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/mcp")
            .with_status(200)
            .with_body(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"missing arg"}}"#)
            .create_async()
            .await;

        let client = McpClient::new();
        let err = client
            .call_tool(&server.url(), "add", json!({}), ReturnHint::Json)
            .await
            .unwrap_err();

        match err {
            MeshError::ToolCallFailed { function, message } => {
                assert_eq!(function, "add");
                assert!(message.contains("missing arg"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_tool_http_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/mcp")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let client = McpClient::new();
        let err = client
            .call_tool(&server.url(), "add", json!({}), ReturnHint::Json)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_call_tool_empty_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/mcp")
            .with_status(200)
            .with_body("")
            .create_async()
            .await;

        let client = McpClient::new();
        let err = client
            .call_tool(&server.url(), "add", json!({}), ReturnHint::Json)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("empty response body"));
    }

    #[tokio::test]
    async fn test_list_tools() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/mcp")
            .with_status(200)
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[{"name":"add"}]}}"#)
            .create_async()
            .await;

        let client = McpClient::new();
        let result = client.list_tools(&server.url()).await.unwrap();
        assert_eq!(result["tools"][0]["name"], "add");
    }
}
