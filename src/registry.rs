//! HTTP client for the mesh registry.
//!
//! Three operations: fast probe (HEAD), full heartbeat/registration (POST),
//! and graceful unregister (DELETE). The full heartbeat response carries the
//! resolved topology the runtime diffs against.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::events::HealthStatus;
use crate::manifest::{AgentManifest, ToolSpec};

/// Errors from registry communication.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Registry returned error: {status} - {message}")]
    Rejected { status: u16, message: String },
}

/// Result of a fast heartbeat probe (HEAD request).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// 200 OK - no topology changes
    NoChanges,
    /// 202 Accepted - topology changed, full heartbeat needed
    TopologyChanged,
    /// 410 Gone - agent unknown, re-register
    AgentUnknown,
    /// 503 Service Unavailable - registry error
    RegistryError,
    /// Connection-level failure
    NetworkError,
}

impl ProbeStatus {
    pub fn from_status_code(code: u16) -> Self {
        match code {
            200 => Self::NoChanges,
            202 => Self::TopologyChanged,
            410 => Self::AgentUnknown,
            503 => Self::RegistryError,
            _ => Self::NetworkError,
        }
    }
}

/// One resolved provider for a declared dependency.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolvedDependency {
    pub agent_id: String,
    pub endpoint: String,
    pub function_name: String,
    pub capability: String,
    pub status: String,
    #[serde(default)]
    pub ttl: u64,
}

impl ResolvedDependency {
    /// Only live providers participate in slot resolution.
    pub fn is_usable(&self) -> bool {
        self.status == "available" || self.status == "healthy"
    }
}

/// Tool advertised to an LLM-bound function.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryToolInfo {
    /// Registry uses "name" for the function name
    #[serde(rename = "name")]
    pub function_name: String,
    pub capability: String,
    pub endpoint: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Resolved LLM provider for an LLM-bound function.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolvedProvider {
    pub agent_id: String,
    pub endpoint: String,
    #[serde(rename = "name")]
    pub function_name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Full heartbeat response.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
    #[serde(default)]
    pub message: String,
    pub agent_id: String,
    /// Keyed by the requesting function's name
    #[serde(default)]
    pub dependencies_resolved: HashMap<String, Vec<ResolvedDependency>>,
    /// Keyed by the LLM-bound function's id
    #[serde(default)]
    pub llm_tools: HashMap<String, Vec<RegistryToolInfo>>,
    #[serde(default)]
    pub llm_providers: HashMap<String, ResolvedProvider>,
}

/// Tool entry in a heartbeat request.
#[derive(Debug, Clone, Serialize)]
pub struct ToolRegistration {
    pub function_name: String,
    pub capability: String,
    pub version: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyRegistration>,
    #[serde(rename = "inputSchema", skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_filter: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_provider: Option<serde_json::Value>,
}

impl ToolRegistration {
    fn from_spec(spec: &ToolSpec) -> Self {
        let llm_binding = spec.llm_bindings.first();
        Self {
            function_name: spec.function_name.clone(),
            capability: spec.capability.clone(),
            version: spec.version.clone(),
            tags: spec.tags.clone(),
            description: if spec.description.is_empty() {
                None
            } else {
                Some(spec.description.clone())
            },
            dependencies: spec
                .dependencies
                .iter()
                .map(|d| DependencyRegistration {
                    capability: d.capability.clone(),
                    tags: d.tags.clone(),
                    version: d.version.clone(),
                })
                .collect(),
            input_schema: spec.input_schema.clone(),
            llm_filter: llm_binding.map(|b| {
                json!({
                    "filters": b.filters,
                    "mode": b.filter_mode,
                })
            }),
            llm_provider: llm_binding.map(|b| serde_json::to_value(&b.provider).unwrap_or_default()),
        }
    }
}

/// Dependency entry in a heartbeat request.
#[derive(Debug, Clone, Serialize)]
pub struct DependencyRegistration {
    pub capability: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Full heartbeat request body.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatRequest {
    pub agent_id: String,
    pub name: String,
    pub version: String,
    pub http_host: String,
    pub http_port: u16,
    pub namespace: String,
    pub status: String,
    pub tools: Vec<ToolRegistration>,
}

impl HeartbeatRequest {
    /// Build a heartbeat request from the manifest.
    pub fn from_manifest(manifest: &AgentManifest, health_status: HealthStatus) -> Self {
        Self {
            agent_id: manifest.agent_id.clone(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            http_host: manifest.http_host.clone(),
            http_port: manifest.http_port,
            namespace: manifest.namespace.clone(),
            status: health_status.as_api_str().to_string(),
            tools: manifest.tools.iter().map(ToolRegistration::from_spec).collect(),
        }
    }
}

/// Client for the mesh registry.
pub struct RegistryClient {
    client: Client,
    base_url: String,
}

impl RegistryClient {
    pub fn new(registry_url: &str) -> Result<Self, RegistryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let base_url = registry_url.trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    /// Fast probe: HEAD /heartbeat/{agent_id}.
    pub async fn probe(&self, agent_id: &str) -> ProbeStatus {
        let url = format!("{}/heartbeat/{}", self.base_url, agent_id);
        trace!("Probe HEAD {}", url);

        match self.client.head(&url).send().await {
            Ok(response) => {
                let status = ProbeStatus::from_status_code(response.status().as_u16());
                debug!(
                    "Probe for '{}': HTTP {} -> {:?}",
                    agent_id,
                    response.status().as_u16(),
                    status
                );
                status
            }
            Err(e) => {
                warn!("Probe failed for '{}': {}", agent_id, e);
                ProbeStatus::NetworkError
            }
        }
    }

    /// Full heartbeat: POST /heartbeat.
    pub async fn send_heartbeat(
        &self,
        request: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse, RegistryError> {
        let url = format!("{}/heartbeat", self.base_url);
        debug!("Sending full heartbeat for '{}'", request.agent_id);
        trace!("Heartbeat request: {:?}", request);

        let response = self.client.post(&url).json(request).send().await?;
        let status = response.status();

        if status.is_success() {
            let body = response.text().await?;
            let parsed: HeartbeatResponse = serde_json::from_str(&body)?;

            debug!(
                "Heartbeat for '{}': {} dependency groups, {} LLM tool sets, {} providers",
                request.agent_id,
                parsed.dependencies_resolved.len(),
                parsed.llm_tools.len(),
                parsed.llm_providers.len()
            );
            Ok(parsed)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(RegistryError::Rejected {
                status: status.as_u16(),
                message: body,
            })
        }
    }

    /// Graceful unregister: DELETE /agents/{agent_id}.
    ///
    /// 404 counts as success - the registry already forgot us.
    pub async fn unregister(&self, agent_id: &str) -> Result<(), RegistryError> {
        let url = format!("{}/agents/{}", self.base_url, agent_id);
        info!("Unregistering '{}' from registry", agent_id);

        match self.client.delete(&url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() || status.as_u16() == 404 {
                    debug!("Unregistered '{}' (HTTP {})", agent_id, status.as_u16());
                    Ok(())
                } else {
                    let body = response.text().await.unwrap_or_default();
                    warn!(
                        "Failed to unregister '{}': HTTP {} - {}",
                        agent_id,
                        status.as_u16(),
                        body
                    );
                    Err(RegistryError::Rejected {
                        status: status.as_u16(),
                        message: body,
                    })
                }
            }
            Err(e) => {
                warn!("Network error unregistering '{}': {}", agent_id, e);
                Err(RegistryError::Network(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{DependencySpec, LlmBinding, Selector};

    fn manifest() -> AgentManifest {
        AgentManifest {
            name: "calc".to_string(),
            agent_id: "calc-1a2b3c4d".to_string(),
            version: "1.0.0".to_string(),
            description: String::new(),
            registry_url: "http://localhost:8000".to_string(),
            http_host: "localhost".to_string(),
            http_port: 9000,
            namespace: "default".to_string(),
            heartbeat_interval: 5,
            tools: vec![ToolSpec {
                function_id: "calc.add".to_string(),
                function_name: "add".to_string(),
                capability: "calc-add".to_string(),
                version: "1.0.0".to_string(),
                tags: vec!["math".to_string()],
                description: "Adds".to_string(),
                dependencies: vec![DependencySpec::new("mul")],
                input_schema: None,
                llm_bindings: vec![LlmBinding::provider(Selector::capability("llm-provider"))],
                route_only: false,
            }],
        }
    }

    #[test]
    fn test_probe_status_from_code() {
        assert_eq!(ProbeStatus::from_status_code(200), ProbeStatus::NoChanges);
        assert_eq!(
            ProbeStatus::from_status_code(202),
            ProbeStatus::TopologyChanged
        );
        assert_eq!(ProbeStatus::from_status_code(410), ProbeStatus::AgentUnknown);
        assert_eq!(
            ProbeStatus::from_status_code(503),
            ProbeStatus::RegistryError
        );
        assert_eq!(ProbeStatus::from_status_code(500), ProbeStatus::NetworkError);
    }

    #[test]
    fn test_heartbeat_request_from_manifest() {
        let request = HeartbeatRequest::from_manifest(&manifest(), HealthStatus::Healthy);

        assert_eq!(request.agent_id, "calc-1a2b3c4d");
        assert_eq!(request.status, "healthy");
        assert_eq!(request.tools.len(), 1);
        assert_eq!(request.tools[0].function_name, "add");
        assert_eq!(request.tools[0].capability, "calc-add");
        assert_eq!(request.tools[0].dependencies[0].capability, "mul");
        assert!(request.tools[0].llm_provider.is_some());
    }

    #[test]
    fn test_resolved_dependency_usability() {
        let make = |status: &str| ResolvedDependency {
            agent_id: "a".to_string(),
            endpoint: "http://x".to_string(),
            function_name: "f".to_string(),
            capability: "c".to_string(),
            status: status.to_string(),
            ttl: 30,
        };
        assert!(make("available").is_usable());
        assert!(make("healthy").is_usable());
        assert!(!make("degraded").is_usable());
        assert!(!make("unknown").is_usable());
    }

    #[tokio::test]
    async fn test_probe_against_mock() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("HEAD", "/heartbeat/calc-1a2b3c4d")
            .with_status(202)
            .create_async()
            .await;

        let client = RegistryClient::new(&server.url()).unwrap();
        let status = client.probe("calc-1a2b3c4d").await;
        assert_eq!(status, ProbeStatus::TopologyChanged);
    }

    #[tokio::test]
    async fn test_heartbeat_parses_topology() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/heartbeat")
            .with_status(200)
            .with_body(
                r#"{
                    "status": "success",
                    "agent_id": "calc-1a2b3c4d",
                    "dependencies_resolved": {
                        "add": [{
                            "agent_id": "math-9f8e7d6c",
                            "endpoint": "http://m:9000",
                            "function_name": "multiply",
                            "capability": "mul",
                            "status": "healthy"
                        }]
                    },
                    "llm_tools": {
                        "calc.add": [{
                            "name": "search",
                            "capability": "web-search",
                            "endpoint": "http://s:9000"
                        }]
                    },
                    "llm_providers": {
                        "calc.add": {
                            "agent_id": "llm-11223344",
                            "endpoint": "http://llm:8080",
                            "name": "chat_completion",
                            "model": "claude-sonnet"
                        }
                    }
                }"#,
            )
            .create_async()
            .await;

        let client = RegistryClient::new(&server.url()).unwrap();
        let request = HeartbeatRequest::from_manifest(&manifest(), HealthStatus::Healthy);
        let response = client.send_heartbeat(&request).await.unwrap();

        let deps = &response.dependencies_resolved["add"];
        assert_eq!(deps[0].capability, "mul");
        assert!(deps[0].is_usable());
        assert_eq!(response.llm_tools["calc.add"][0].function_name, "search");
        assert_eq!(
            response.llm_providers["calc.add"].model.as_deref(),
            Some("claude-sonnet")
        );
    }

    #[tokio::test]
    async fn test_heartbeat_rejection() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/heartbeat")
            .with_status(422)
            .with_body("bad manifest")
            .create_async()
            .await;

        let client = RegistryClient::new(&server.url()).unwrap();
        let request = HeartbeatRequest::from_manifest(&manifest(), HealthStatus::Healthy);
        let err = client.send_heartbeat(&request).await.unwrap_err();
        assert!(matches!(err, RegistryError::Rejected { status: 422, .. }));
    }

    #[tokio::test]
    async fn test_unregister_tolerates_404() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/agents/calc-1a2b3c4d")
            .with_status(404)
            .create_async()
            .await;

        let client = RegistryClient::new(&server.url()).unwrap();
        assert!(client.unregister("calc-1a2b3c4d").await.is_ok());
    }
}
