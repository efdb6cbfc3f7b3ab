//! Agent lifecycle: orderly start and stop of the runtime pieces.
//!
//! Start is two-phase: the manifest goes to the mesh core, which begins
//! background registration and event production; then the event processor
//! starts draining the stream. The HTTP server binds first so an assigned
//! port is known before the first heartbeat. Stop runs the phases in
//! reverse.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::builder::AgentAssembly;
use crate::error::{MeshError, Result};
use crate::events::HealthStatus;
use crate::handle::CoreHandle;
use crate::manifest::AgentManifest;
use crate::processor::EventProcessor;
use crate::runtime::RuntimeConfig;
use crate::server::{AgentServer, ServerState};
use crate::tracing_publish;
use crate::wrappers::WrapperRegistry;

/// How long stop waits for the core to confirm shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

/// Start-time options.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Header names captured at the request boundary and forwarded on
    /// outbound calls
    pub propagation_headers: Vec<String>,

    /// Mesh core runtime tunables
    pub runtime: RuntimeConfig,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            propagation_headers: vec![
                "x-request-id".to_string(),
                "x-correlation-id".to_string(),
            ],
            runtime: RuntimeConfig::default(),
        }
    }
}

/// A running mesh agent.
pub struct MeshAgent {
    manifest: Arc<AgentManifest>,
    registry: Arc<WrapperRegistry>,
    handle: Arc<CoreHandle>,
    processor: Option<EventProcessor>,
    server: Option<AgentServer>,
    running: Arc<AtomicBool>,
}

impl MeshAgent {
    /// Start an agent from a built assembly with default options.
    pub async fn start(assembly: AgentAssembly) -> Result<Self> {
        Self::start_with(assembly, StartOptions::default()).await
    }

    /// Start an agent with explicit options.
    pub async fn start_with(assembly: AgentAssembly, options: StartOptions) -> Result<Self> {
        let AgentAssembly {
            mut manifest,
            registry,
            llm_configs,
        } = assembly;

        tracing_publish::init_trace_publisher().await;

        let running = Arc::new(AtomicBool::new(true));

        // Bind before registering so an assigned port is announced, never
        // the placeholder.
        let server = AgentServer::start(
            ServerState {
                registry: registry.clone(),
                manifest: Arc::new(manifest.clone()),
                running: running.clone(),
                propagation_headers: Arc::new(options.propagation_headers.clone()),
            },
            &manifest.http_host,
            manifest.http_port,
        )
        .await?;
        if manifest.http_port == 0 {
            manifest.http_port = server.addr.port();
            info!("Assigned HTTP port {}", manifest.http_port);
        }
        let manifest = Arc::new(manifest);

        // Phase 1: the core starts registering and producing events.
        let handle = CoreHandle::start((*manifest).clone(), options.runtime)
            .map_err(|e| MeshError::Registration(e.to_string()))?;
        let handle = Arc::new(handle);

        // Phase 2: the processor starts draining them.
        let processor = EventProcessor::spawn(handle.clone(), registry.clone(), llm_configs);

        info!(
            "Mesh agent '{}' started on {}:{}",
            manifest.agent_id, manifest.http_host, manifest.http_port
        );

        Ok(Self {
            manifest,
            registry,
            handle,
            processor: Some(processor),
            server: Some(server),
            running,
        })
    }

    pub fn manifest(&self) -> &AgentManifest {
        &self.manifest
    }

    pub fn agent_id(&self) -> &str {
        &self.manifest.agent_id
    }

    pub fn registry(&self) -> Arc<WrapperRegistry> {
        self.registry.clone()
    }

    /// Handle to the mesh core (state queries, health reporting).
    pub fn core(&self) -> Arc<CoreHandle> {
        self.handle.clone()
    }

    /// Whether the runtime is up (drives the health probe).
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Report a new health status; rides on the next heartbeat.
    pub async fn report_health(&self, status: HealthStatus) {
        self.handle.report_health(status).await;
    }

    /// Stop in reverse start order: processor, core, HTTP server.
    pub async fn stop(mut self) {
        info!("Stopping mesh agent '{}'", self.manifest.agent_id);
        self.running.store(false, Ordering::SeqCst);

        if let Some(processor) = self.processor.take() {
            processor.stop().await;
        }

        self.handle.shutdown().await;
        // Give the core a moment to unregister and confirm.
        let drained = tokio::time::timeout(SHUTDOWN_DRAIN, async {
            loop {
                match self.handle.next_event().await {
                    None => break,
                    Some(event) if event.event_type == crate::events::EventType::Shutdown => break,
                    Some(_) => {}
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("Core did not confirm shutdown within {:?}", SHUTDOWN_DRAIN);
        }

        if let Some(server) = self.server.take() {
            server.stop();
        }

        info!("Mesh agent '{}' stopped", self.manifest.agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::AgentBuilder;
    use crate::schema::ParamSpec;
    use serde_json::json;

    fn heartbeat_body(agent_id: &str) -> String {
        format!(
            r#"{{"status":"success","agent_id":"{}","dependencies_resolved":{{}},"llm_tools":{{}},"llm_providers":{{}}}}"#,
            agent_id
        )
    }

    async fn start_test_agent(registry_url: &str) -> MeshAgent {
        let assembly = AgentBuilder::new("lifecycle-test")
            .registry_url(registry_url)
            .http_host("localhost")
            .heartbeat_interval(1)
            .tool("echo", |t| {
                t.param(ParamSpec::string("text"))
                    .handler(|inv| async move {
                        let text: String = inv.arg("text")?;
                        Ok(json!(text))
                    })
            })
            .build()
            .unwrap();

        MeshAgent::start(assembly).await.unwrap()
    }

    #[tokio::test]
    async fn test_start_serves_and_stops() {
        let mut registry_server = mockito::Server::new_async().await;
        registry_server
            .mock("POST", "/heartbeat")
            .with_status(200)
            .with_body(heartbeat_body("lifecycle-test-00000000"))
            .create_async()
            .await;

        let agent = start_test_agent(&registry_server.url()).await;
        assert!(agent.is_running());
        assert!(agent.agent_id().starts_with("lifecycle-test-"));

        let port = agent.manifest().http_port;
        assert_ne!(port, 0);

        // The MCP endpoint serves while running
        let client = reqwest::Client::new();
        let response: serde_json::Value = client
            .post(format!("http://127.0.0.1:{}/mcp", port))
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "tools/call",
                "params": {"name": "echo", "arguments": {"text": "hi"}},
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(response["result"]["content"][0]["text"], "\"hi\"");

        agent.stop().await;
    }

    #[tokio::test]
    async fn test_standalone_mode_keeps_serving() {
        // Registry URL that refuses connections: registration fails, the
        // agent serves anyway
        let agent = start_test_agent("http://127.0.0.1:1").await;
        let port = agent.manifest().http_port;

        let client = reqwest::Client::new();
        let response = client
            .get(format!("http://127.0.0.1:{}/health", port))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);

        let response: serde_json::Value = client
            .post(format!("http://127.0.0.1:{}/mcp", port))
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "tools/call",
                "params": {"name": "echo", "arguments": {"text": "standalone"}},
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(
            response["result"]["content"][0]["text"],
            "\"standalone\""
        );

        agent.stop().await;
    }
}
