//! Error types for the mesh agent SDK.
//!
//! The kinds here mirror how failures propagate through the runtime:
//! unavailable dependencies surface lazily when user code dereferences a
//! proxy, upstream call failures are caught and fed back to LLM loops as
//! JSON, and argument problems become JSON-RPC errors on the wire.

use serde_json::{json, Value};
use thiserror::Error;

/// Errors produced by the mesh agent runtime.
#[derive(Debug, Error)]
pub enum MeshError {
    /// A declared dependency or LLM provider has no active endpoint.
    #[error("Tool '{0}' is not available")]
    ToolUnavailable(String),

    /// An upstream tool call failed: JSON-RPC error, non-2xx, malformed
    /// body, or broken connection.
    #[error("Tool call '{function}' failed: {message}")]
    ToolCallFailed { function: String, message: String },

    /// A required MCP argument was missing or could not be converted.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Registry communication failed during startup or heartbeat.
    #[error("Registration failed: {0}")]
    Registration(String),

    /// LLM agent misconfiguration (no provider bound, provider not yet
    /// available).
    #[error("LLM agent error: {0}")]
    LlmState(String),

    /// The user handler itself returned an error.
    #[error("Tool execution failed: {0}")]
    Execution(String),

    /// The handler did not complete within the invocation timeout.
    #[error("Tool '{0}' timed out")]
    Timeout(String),

    /// Network error from the HTTP client.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON encoding/decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Manifest construction failed (duplicate capability, missing field).
    #[error("Invalid manifest: {0}")]
    Manifest(String),
}

impl MeshError {
    /// Short machine-readable kind used in structured error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            MeshError::ToolUnavailable(_) => "tool_unavailable",
            MeshError::ToolCallFailed { .. } => "tool_call_failed",
            MeshError::InvalidArgument(_) => "invalid_argument",
            MeshError::Registration(_) => "registration_failed",
            MeshError::LlmState(_) => "llm_state",
            MeshError::Execution(_) => "execution_failed",
            MeshError::Timeout(_) => "timeout",
            MeshError::Network(_) => "network",
            MeshError::Json(_) => "json",
            MeshError::Manifest(_) => "invalid_manifest",
        }
    }

    /// JSON-RPC error code for wire responses.
    ///
    /// Argument problems map to the standard invalid-params code; everything
    /// else is an internal error.
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            MeshError::InvalidArgument(_) => -32602,
            MeshError::ToolUnavailable(_) => -32001,
            _ => -32603,
        }
    }

    /// Structured error object returned to LLM loops so the model can
    /// self-correct instead of the loop aborting.
    pub fn to_llm_json(&self, tool: &str) -> Value {
        json!({
            "error": {
                "type": self.kind(),
                "tool": tool,
                "message": self.to_string(),
            }
        })
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, MeshError>;
