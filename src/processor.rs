//! The event processor: single consumer of mesh topology events.
//!
//! One dedicated task drains the core's event stream with a bounded poll
//! and applies each event serially - wrapper slots and the proxy table are
//! never mutated concurrently. Handler failures are logged and the loop
//! continues; only a shutdown event (or stop request) ends it.
//!
//! LLM agents are created lazily on whichever event arrives first - tools
//! or provider - and both paths converge on the same agent reference.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{EventType, LlmProviderInfo, LlmToolInfo, MeshEvent};
use crate::handle::CoreHandle;
use crate::llm::{LlmAgent, LocalToolDispatch, ProviderBinding};
use crate::manifest::LlmBinding;
use crate::wrappers::WrapperRegistry;

/// Default bounded-poll interval for the event loop.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the running event processor task.
pub struct EventProcessor {
    running: Arc<AtomicBool>,
    stop: Arc<Notify>,
    join: JoinHandle<()>,
}

impl EventProcessor {
    /// Spawn the processor worker.
    pub fn spawn(
        handle: Arc<CoreHandle>,
        registry: Arc<WrapperRegistry>,
        llm_configs: HashMap<String, LlmBinding>,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(Notify::new());
        let worker = Worker {
            handle,
            registry,
            llm_configs,
            llm_agents: HashMap::new(),
            pending_tools: HashMap::new(),
            running: running.clone(),
            stop: stop.clone(),
        };
        let join = tokio::spawn(worker.run());
        Self { running, stop, join }
    }

    /// Cooperative stop: the worker wakes from its poll and exits.
    pub async fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop.notify_one();
        let _ = self.join.await;
    }
}

struct Worker {
    handle: Arc<CoreHandle>,
    registry: Arc<WrapperRegistry>,
    llm_configs: HashMap<String, LlmBinding>,
    /// Live agents per owning function id
    llm_agents: HashMap<String, Arc<LlmAgent>>,
    /// Tools that arrived before their wrapper was resolvable, keyed by the
    /// publisher's name (full or short)
    pending_tools: HashMap<String, Vec<LlmToolInfo>>,
    running: Arc<AtomicBool>,
    stop: Arc<Notify>,
}

impl Worker {
    async fn run(mut self) {
        info!("Event processor started");

        while self.running.load(Ordering::SeqCst) {
            let polled = tokio::select! {
                polled = self.handle.poll_event(POLL_TIMEOUT) => polled,
                _ = self.stop.notified() => break,
            };
            let Some(event) = polled else {
                continue;
            };

            let event_type = event.event_type;
            debug!("Processing event: {}", event_type.as_str());

            if event_type == EventType::Shutdown {
                info!("Event processor stopping: shutdown event");
                break;
            }
            self.handle_event(event);
        }

        info!("Event processor stopped");
    }

    /// Apply one event. Never fatal: bad events are logged and skipped.
    fn handle_event(&mut self, event: MeshEvent) {
        match event.event_type {
            EventType::AgentRegistered => self.on_agent_registered(),
            EventType::DependencyAvailable => self.on_dependency_endpoint(event),
            EventType::DependencyChanged => {
                // Changed routes as available when an endpoint is present,
                // unavailable otherwise
                if event.endpoint.is_some() {
                    self.on_dependency_endpoint(event);
                } else {
                    self.on_dependency_unavailable(event);
                }
            }
            EventType::DependencyUnavailable => self.on_dependency_unavailable(event),
            EventType::LlmToolsUpdated => self.on_llm_tools(event),
            EventType::LlmProviderAvailable => self.on_llm_provider(event),
            EventType::RegistrationFailed => {
                // Standalone-mode tolerance: the agent keeps serving
                warn!(
                    "Registration failed (continuing standalone): {}",
                    event.error.unwrap_or_default()
                );
            }
            EventType::HealthStatusChanged
            | EventType::RegistryConnected
            | EventType::RegistryDisconnected => {
                debug!("Registry status event: {}", event.event_type.as_str());
            }
            EventType::Shutdown => {}
        }
    }

    /// Initialize direct-mode LLM agents whose provider is known from
    /// configuration.
    fn on_agent_registered(&mut self) {
        let direct: Vec<(String, ProviderBinding)> = self
            .llm_configs
            .iter()
            .filter_map(|(function_id, binding)| {
                binding.direct.as_ref().map(|d| {
                    (
                        function_id.clone(),
                        ProviderBinding {
                            endpoint: d.endpoint.clone(),
                            function_name: d.function_name.clone(),
                            model: d.model.clone(),
                        },
                    )
                })
            })
            .collect();

        for (function_id, provider) in direct {
            if let Some(agent) = self.ensure_agent(&function_id) {
                info!(
                    "Direct-mode LLM provider for '{}' at {}",
                    function_id, provider.endpoint
                );
                agent.set_provider(provider);
            }
        }
    }

    fn on_dependency_endpoint(&mut self, event: MeshEvent) {
        let (Some(function_id), Some(index), Some(endpoint), Some(function_name)) = (
            event.function_id,
            event.dep_index,
            event.endpoint,
            event.function_name,
        ) else {
            warn!("Dependency event missing fields; ignored");
            return;
        };
        let key = format!("{}:dep_{}", function_id, index);
        self.registry.update_dependency(&key, &endpoint, &function_name);
    }

    fn on_dependency_unavailable(&mut self, event: MeshEvent) {
        let (Some(function_id), Some(index)) = (event.function_id, event.dep_index) else {
            warn!("Dependency event missing fields; ignored");
            return;
        };
        let key = format!("{}:dep_{}", function_id, index);
        self.registry.mark_dependency_unavailable(&key);
    }

    /// Tools-first ordering: create the agent now if needed; cache the
    /// tools when no wrapper matches yet.
    fn on_llm_tools(&mut self, event: MeshEvent) {
        let (Some(function_id), Some(tools)) = (event.function_id, event.tools) else {
            warn!("LLM tools event missing fields; ignored");
            return;
        };

        match self.ensure_agent(&function_id) {
            Some(agent) => agent.set_tools(tools),
            None => {
                debug!(
                    "No wrapper for '{}' yet; caching {} tools",
                    function_id,
                    tools.len()
                );
                let short = short_name(&function_id).to_string();
                self.pending_tools.insert(function_id, tools.clone());
                self.pending_tools.insert(short, tools);
            }
        }
    }

    /// Provider-first or provider-after-tools: both converge on the same
    /// agent reference; pending tools drain once the provider lands.
    fn on_llm_provider(&mut self, event: MeshEvent) {
        let Some(info) = event.provider_info else {
            warn!("LLM provider event missing provider info; ignored");
            return;
        };
        let LlmProviderInfo {
            function_id,
            endpoint,
            function_name,
            model,
            ..
        } = info;

        let Some(agent) = self.ensure_agent(&function_id) else {
            warn!(
                "LLM provider event for unknown function '{}'; ignored",
                function_id
            );
            return;
        };

        agent.set_provider(ProviderBinding {
            endpoint,
            function_name,
            model,
        });

        // Drain tools that arrived before the agent existed
        let pending = self
            .pending_tools
            .remove(&function_id)
            .or_else(|| self.pending_tools.remove(short_name(&function_id)));
        if let Some(tools) = pending {
            debug!(
                "Applying {} cached tools to '{}'",
                tools.len(),
                function_id
            );
            agent.set_tools(tools);
        }
    }

    /// Find or lazily create the LLM agent owning `name`, writing it into
    /// every LLM slot of its wrapper.
    fn ensure_agent(&mut self, name: &str) -> Option<Arc<LlmAgent>> {
        if let Some(agent) = self.llm_agents.get(name) {
            return Some(agent.clone());
        }

        let wrapper = self.registry.wrapper(name)?;
        let function_id = wrapper.function_id().to_string();
        if let Some(agent) = self.llm_agents.get(&function_id) {
            return Some(agent.clone());
        }

        let binding = self
            .find_config(&function_id)
            .or_else(|| self.find_config(name))
            .cloned()
            .unwrap_or_else(|| {
                debug!("No LLM config for '{}'; using defaults", function_id);
                LlmBinding::default()
            });

        let agent = Arc::new(LlmAgent::from_binding(
            function_id.clone(),
            &binding,
            self.registry.factory(),
        ));
        let local: Arc<dyn LocalToolDispatch> = self.registry.clone();
        agent.set_local_dispatch(Arc::downgrade(&local));

        for index in 0..wrapper.llm_count() {
            let key = format!("{}:llm_{}", function_id, index);
            self.registry.update_llm_agent(&key, agent.clone());
        }

        info!("LLM agent created for '{}'", function_id);
        self.llm_agents.insert(function_id, agent.clone());
        Some(agent)
    }

    /// Config lookup: exact function id first, short method name second.
    fn find_config(&self, name: &str) -> Option<&LlmBinding> {
        if let Some(binding) = self.llm_configs.get(name) {
            return Some(binding);
        }
        let short = short_name(name);
        self.llm_configs
            .iter()
            .find(|(key, _)| short_name(key) == short)
            .map(|(_, binding)| binding)
    }
}

fn short_name(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}
