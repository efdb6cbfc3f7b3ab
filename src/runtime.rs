//! Mesh core runtime - the background task that owns registration and
//! topology.
//!
//! The runtime drives the heartbeat state machine, diffs successive
//! registry responses, and emits only the deltas as events. Dependency
//! diffing is keyed per slot - (requesting function id, dependency index) -
//! so each emitted event addresses exactly one wrapper slot and slots stay
//! independently replaceable.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::events::{HealthStatus, LlmProviderInfo, LlmToolInfo, MeshEvent};
use crate::handle::CoreState;
use crate::heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatStateMachine};
use crate::manifest::AgentManifest;
use crate::registry::{HeartbeatRequest, HeartbeatResponse, RegistryClient, RegistryError};

/// Commands the SDK can send into the running core.
#[derive(Debug)]
pub enum RuntimeCommand {
    /// Report a new health status; rides on the next heartbeat.
    SetHealth(HealthStatus),
}

/// Configuration for the core runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub heartbeat: HeartbeatConfig,
    /// Event channel buffer size
    pub event_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            event_buffer_size: 100,
        }
    }
}

/// Tracked value of one dependency slot.
#[derive(Debug, Clone, PartialEq)]
struct SlotBinding {
    endpoint: String,
    function_name: String,
    agent_id: String,
}

/// Tracked provider for one LLM-bound function.
#[derive(Debug, Clone, PartialEq)]
struct ProviderBindingState {
    endpoint: String,
    function_name: String,
    model: Option<String>,
    agent_id: String,
}

/// Current topology as last seen from the registry.
#[derive(Debug, Default)]
struct TopologyState {
    /// (function id, dep index) -> resolved binding
    dep_slots: HashMap<(String, usize), SlotBinding>,
    /// function id -> advertised tools
    llm_tools: HashMap<String, Vec<LlmToolInfo>>,
    /// function id -> provider
    llm_providers: HashMap<String, ProviderBindingState>,
}

/// The core runtime loop.
pub struct CoreRuntime {
    manifest: AgentManifest,
    registry_client: RegistryClient,
    state_machine: HeartbeatStateMachine,
    topology: TopologyState,
    event_tx: mpsc::Sender<MeshEvent>,
    shared_state: Arc<RwLock<CoreState>>,
    shutdown_rx: mpsc::Receiver<()>,
    command_rx: mpsc::Receiver<RuntimeCommand>,
    was_connected: bool,
}

impl CoreRuntime {
    pub fn new(
        manifest: AgentManifest,
        config: RuntimeConfig,
        event_tx: mpsc::Sender<MeshEvent>,
        shared_state: Arc<RwLock<CoreState>>,
        shutdown_rx: mpsc::Receiver<()>,
        command_rx: mpsc::Receiver<RuntimeCommand>,
    ) -> Result<Self, RegistryError> {
        let registry_client = RegistryClient::new(&manifest.registry_url)?;
        let heartbeat_config = HeartbeatConfig {
            interval: std::time::Duration::from_secs(manifest.heartbeat_interval),
            ..config.heartbeat
        };

        Ok(Self {
            manifest,
            registry_client,
            state_machine: HeartbeatStateMachine::new(heartbeat_config),
            topology: TopologyState::default(),
            event_tx,
            shared_state,
            shutdown_rx,
            command_rx,
            was_connected: false,
        })
    }

    /// Run until shutdown is requested.
    pub async fn run(mut self) {
        info!("Starting mesh core for '{}'", self.manifest.agent_id);

        loop {
            self.drain_commands().await;

            if self.shutdown_rx.try_recv().is_ok() {
                info!("Shutdown signal received");
                self.state_machine.shutdown();
            }

            if self.state_machine.is_draining() {
                self.unregister().await;
                break;
            }

            match self.state_machine.next_action() {
                HeartbeatAction::Register => {
                    self.send_full_heartbeat().await;
                }
                HeartbeatAction::Probe => {
                    self.send_probe().await;
                }
                HeartbeatAction::Sleep(duration) => {
                    tokio::select! {
                        _ = sleep(duration) => {}
                        _ = self.shutdown_rx.recv() => {
                            info!("Shutdown signal received during wait");
                            self.state_machine.shutdown();
                        }
                    }
                }
                HeartbeatAction::Reconnect { attempt, backoff } => {
                    debug!("Standalone retry {} after {:?}", attempt, backoff);
                    tokio::select! {
                        _ = sleep(backoff) => {
                            self.send_full_heartbeat().await;
                        }
                        _ = self.shutdown_rx.recv() => {
                            info!("Shutdown signal received during backoff");
                            self.state_machine.shutdown();
                        }
                    }
                }
                HeartbeatAction::Stop => break,
            }
        }

        let _ = self.event_tx.send(MeshEvent::shutdown(None)).await;
        info!("Mesh core for '{}' stopped", self.manifest.agent_id);
    }

    async fn drain_commands(&mut self) {
        while let Ok(command) = self.command_rx.try_recv() {
            match command {
                RuntimeCommand::SetHealth(status) => {
                    self.state_machine.set_health_status(status);
                    {
                        let mut state = self.shared_state.write().await;
                        state.health_status = status;
                    }
                    let _ = self
                        .event_tx
                        .send(MeshEvent::health_status_changed(status))
                        .await;
                }
            }
        }
    }

    /// Unregister during shutdown so dependents get topology updates now
    /// rather than at heartbeat timeout.
    async fn unregister(&self) {
        let agent_id = &self.manifest.agent_id;
        match self.registry_client.unregister(agent_id).await {
            Ok(()) => info!("Agent '{}' unregistered", agent_id),
            Err(e) => {
                // Network trouble must not block shutdown
                warn!("Failed to unregister '{}' (continuing shutdown): {}", agent_id, e);
            }
        }
    }

    async fn send_probe(&mut self) {
        let status = self.registry_client.probe(&self.manifest.agent_id).await;
        let action = self.state_machine.on_probe_result(status);

        if self.state_machine.is_standalone() && self.was_connected {
            self.was_connected = false;
            let _ = self
                .event_tx
                .send(MeshEvent::registry_disconnected(format!("{:?}", status)))
                .await;
        }

        if action == HeartbeatAction::Register {
            self.send_full_heartbeat().await;
        }
    }

    async fn send_full_heartbeat(&mut self) {
        let request =
            HeartbeatRequest::from_manifest(&self.manifest, self.state_machine.health_status());

        match self.registry_client.send_heartbeat(&request).await {
            Ok(response) => {
                let first = self.state_machine.heartbeat_count() == 0;
                self.state_machine.on_register_success();

                {
                    let mut state = self.shared_state.write().await;
                    state.registered = true;
                    state.registry_agent_id = Some(response.agent_id.clone());
                }

                if !self.was_connected {
                    self.was_connected = true;
                    let _ = self.event_tx.send(MeshEvent::registry_connected()).await;
                }
                if first {
                    let _ = self
                        .event_tx
                        .send(MeshEvent::agent_registered(self.manifest.agent_id.clone()))
                        .await;
                }

                self.process_heartbeat_response(response).await;
            }
            Err(e) => {
                self.state_machine.on_register_failure(&e.to_string());
                {
                    let mut state = self.shared_state.write().await;
                    state.registered = false;
                }
                let _ = self
                    .event_tx
                    .send(MeshEvent::registration_failed(e.to_string()))
                    .await;
            }
        }
    }

    async fn process_heartbeat_response(&mut self, response: HeartbeatResponse) {
        self.process_dependency_changes(&response).await;
        self.process_llm_tools_changes(&response).await;
        self.process_llm_provider_changes(&response).await;
    }

    /// Diff resolved dependencies slot by slot and emit the deltas.
    async fn process_dependency_changes(&mut self, response: &HeartbeatResponse) {
        // Desired bindings per slot, derived by matching each declared
        // dependency (in declaration order) against the providers resolved
        // for its requesting function.
        let mut desired: HashMap<(String, usize), SlotBinding> = HashMap::new();

        for tool in &self.manifest.tools {
            let providers = response
                .dependencies_resolved
                .get(&tool.function_name)
                .or_else(|| response.dependencies_resolved.get(&tool.function_id));
            let Some(providers) = providers else {
                continue;
            };

            for (index, dep) in tool.dependencies.iter().enumerate() {
                let resolved = providers
                    .iter()
                    .find(|p| p.capability == dep.capability && p.is_usable());
                if let Some(provider) = resolved {
                    desired.insert(
                        (tool.function_id.clone(), index),
                        SlotBinding {
                            endpoint: provider.endpoint.clone(),
                            function_name: provider.function_name.clone(),
                            agent_id: provider.agent_id.clone(),
                        },
                    );
                }
            }
        }

        // Removed slots
        let removed: Vec<(String, usize)> = self
            .topology
            .dep_slots
            .keys()
            .filter(|key| !desired.contains_key(*key))
            .cloned()
            .collect();

        for (function_id, index) in removed {
            let capability = self.dep_capability(&function_id, index);
            info!("Dependency '{}' of '{}' removed", capability, function_id);
            let _ = self
                .event_tx
                .send(MeshEvent::dependency_unavailable(
                    function_id.clone(),
                    index,
                    capability.clone(),
                ))
                .await;
            self.topology.dep_slots.remove(&(function_id, index));

            let mut state = self.shared_state.write().await;
            state.dependencies.remove(&capability);
        }

        // New or changed slots
        for (key, binding) in desired {
            let previous = self.topology.dep_slots.get(&key);
            if previous == Some(&binding) {
                continue;
            }
            let is_new = previous.is_none();
            let (function_id, index) = key.clone();
            let capability = self.dep_capability(&function_id, index);

            info!(
                "Dependency '{}' of '{}' {} at {} ({})",
                capability,
                function_id,
                if is_new { "available" } else { "changed" },
                binding.endpoint,
                binding.function_name
            );

            let event = if is_new {
                MeshEvent::dependency_available(
                    function_id.clone(),
                    index,
                    capability.clone(),
                    binding.endpoint.clone(),
                    binding.function_name.clone(),
                    binding.agent_id.clone(),
                )
            } else {
                MeshEvent::dependency_changed(
                    function_id.clone(),
                    index,
                    capability.clone(),
                    binding.endpoint.clone(),
                    binding.function_name.clone(),
                    binding.agent_id.clone(),
                )
            };
            let _ = self.event_tx.send(event).await;

            {
                let mut state = self.shared_state.write().await;
                state
                    .dependencies
                    .insert(capability, binding.endpoint.clone());
            }
            self.topology.dep_slots.insert(key, binding);
        }
    }

    fn dep_capability(&self, function_id: &str, index: usize) -> String {
        self.manifest
            .tool(function_id)
            .and_then(|tool| tool.dependencies.get(index))
            .map(|dep| dep.capability.clone())
            .unwrap_or_default()
    }

    async fn process_llm_tools_changes(&mut self, response: &HeartbeatResponse) {
        for (function_id, tools) in &response.llm_tools {
            let tool_infos: Vec<LlmToolInfo> = tools
                .iter()
                .map(|t| LlmToolInfo {
                    function_name: t.function_name.clone(),
                    capability: t.capability.clone(),
                    endpoint: t.endpoint.clone(),
                    agent_id: t.agent_id.clone(),
                    input_schema: t.input_schema.clone(),
                    description: t.description.clone(),
                })
                .collect();

            let changed = self
                .topology
                .llm_tools
                .get(function_id)
                .map(|old| old != &tool_infos)
                .unwrap_or(true);

            if changed {
                info!(
                    "LLM tools updated for '{}': {} tools",
                    function_id,
                    tool_infos.len()
                );
                let _ = self
                    .event_tx
                    .send(MeshEvent::llm_tools_updated(
                        function_id.clone(),
                        tool_infos.clone(),
                    ))
                    .await;
                self.topology
                    .llm_tools
                    .insert(function_id.clone(), tool_infos);
            }
        }
    }

    async fn process_llm_provider_changes(&mut self, response: &HeartbeatResponse) {
        for (function_id, provider) in &response.llm_providers {
            let tracked = ProviderBindingState {
                endpoint: provider.endpoint.clone(),
                function_name: provider.function_name.clone(),
                model: provider.model.clone(),
                agent_id: provider.agent_id.clone(),
            };

            let changed = self
                .topology
                .llm_providers
                .get(function_id)
                .map(|old| old.endpoint != tracked.endpoint || old.function_name != tracked.function_name)
                .unwrap_or(true);

            if changed {
                info!(
                    "LLM provider for '{}': '{}' at {}",
                    function_id, tracked.function_name, tracked.endpoint
                );
                self.topology
                    .llm_providers
                    .insert(function_id.clone(), tracked.clone());

                let _ = self
                    .event_tx
                    .send(MeshEvent::llm_provider_available(LlmProviderInfo {
                        function_id: function_id.clone(),
                        agent_id: tracked.agent_id,
                        endpoint: tracked.endpoint,
                        function_name: tracked.function_name,
                        model: tracked.model,
                    }))
                    .await;
            }
        }
    }
}
