//! Topology events emitted by the mesh core to the agent runtime.
//!
//! Events are pushed from the core's heartbeat loop to the event processor
//! via an async channel. The processor consumes them serially and updates
//! proxy and wrapper-slot state.
//!
//! Dependency events are keyed per slot: the requesting function id plus the
//! dependency's declaration index. Each slot is independently replaceable, so
//! no ordering is promised across distinct slots.

use serde::{Deserialize, Serialize};

/// Type of mesh event.
///
/// Serializes to snake_case strings for wire/log compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Agent successfully registered with the mesh registry
    AgentRegistered,
    /// Agent registration failed (agent continues in standalone mode)
    RegistrationFailed,
    /// A dependency slot became available
    DependencyAvailable,
    /// A dependency slot became unavailable
    DependencyUnavailable,
    /// A dependency slot's endpoint or function changed
    DependencyChanged,
    /// LLM tools list was updated for an LLM-bound function
    LlmToolsUpdated,
    /// LLM provider became available for an LLM-bound function
    LlmProviderAvailable,
    /// Agent health status changed
    HealthStatusChanged,
    /// Connected to registry
    RegistryConnected,
    /// Disconnected from registry
    RegistryDisconnected,
    /// Agent runtime is shutting down
    #[default]
    Shutdown,
}

impl EventType {
    /// String representation used in serialization and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AgentRegistered => "agent_registered",
            EventType::RegistrationFailed => "registration_failed",
            EventType::DependencyAvailable => "dependency_available",
            EventType::DependencyUnavailable => "dependency_unavailable",
            EventType::DependencyChanged => "dependency_changed",
            EventType::LlmToolsUpdated => "llm_tools_updated",
            EventType::LlmProviderAvailable => "llm_provider_available",
            EventType::HealthStatusChanged => "health_status_changed",
            EventType::RegistryConnected => "registry_connected",
            EventType::RegistryDisconnected => "registry_disconnected",
            EventType::Shutdown => "shutdown",
        }
    }
}

/// Health status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Agent is fully operational
    #[default]
    Healthy,
    /// Agent has reduced functionality
    Degraded,
    /// Agent is not operational
    Unhealthy,
}

impl HealthStatus {
    /// Convert to the registry API status string.
    pub fn as_api_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Provider details carried by an `LlmProviderAvailable` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProviderInfo {
    /// Function id of the LLM-bound function that requested this provider
    pub function_id: String,

    /// Agent id providing the capability
    pub agent_id: String,

    /// Endpoint URL to call
    pub endpoint: String,

    /// Function name to call on the provider
    pub function_name: String,

    /// Model name, when the provider advertises one
    pub model: Option<String>,
}

/// Tool details carried by an `LlmToolsUpdated` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmToolInfo {
    /// Function name of the tool
    pub function_name: String,

    /// Capability name
    pub capability: String,

    /// Endpoint URL to call
    pub endpoint: String,

    /// Agent id providing this tool
    pub agent_id: String,

    /// Input schema for function-call advertisement
    pub input_schema: Option<serde_json::Value>,

    /// Human-readable description
    pub description: Option<String>,
}

/// Events emitted by the mesh core to the agent runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshEvent {
    /// Event type identifier
    pub event_type: EventType,

    // Fields for dependency events
    /// Requesting function id (for dependency events)
    pub function_id: Option<String>,

    /// Dependency declaration index within the requesting tool
    pub dep_index: Option<usize>,

    /// Capability name (for dependency events)
    pub capability: Option<String>,

    /// Endpoint URL (for dependency_available / dependency_changed)
    pub endpoint: Option<String>,

    /// Function name to call (for dependency_available / dependency_changed)
    pub function_name: Option<String>,

    /// Agent id (registration and dependency events)
    pub agent_id: Option<String>,

    // Fields for LLM events
    /// Available tools (for llm_tools_updated)
    pub tools: Option<Vec<LlmToolInfo>>,

    /// Provider info (for llm_provider_available)
    pub provider_info: Option<LlmProviderInfo>,

    // Fields for error/status events
    /// Error message (for registration_failed)
    pub error: Option<String>,

    /// Health status (for health_status_changed)
    pub status: Option<HealthStatus>,

    /// Reason (for disconnect/shutdown events)
    pub reason: Option<String>,
}

impl MeshEvent {
    /// Create an "agent_registered" event
    pub fn agent_registered(agent_id: String) -> Self {
        Self {
            event_type: EventType::AgentRegistered,
            agent_id: Some(agent_id),
            ..Default::default()
        }
    }

    /// Create a "registration_failed" event
    pub fn registration_failed(error: String) -> Self {
        Self {
            event_type: EventType::RegistrationFailed,
            error: Some(error),
            ..Default::default()
        }
    }

    /// Create a "dependency_available" event for one slot
    pub fn dependency_available(
        function_id: String,
        dep_index: usize,
        capability: String,
        endpoint: String,
        function_name: String,
        agent_id: String,
    ) -> Self {
        Self {
            event_type: EventType::DependencyAvailable,
            function_id: Some(function_id),
            dep_index: Some(dep_index),
            capability: Some(capability),
            endpoint: Some(endpoint),
            function_name: Some(function_name),
            agent_id: Some(agent_id),
            ..Default::default()
        }
    }

    /// Create a "dependency_unavailable" event for one slot
    pub fn dependency_unavailable(
        function_id: String,
        dep_index: usize,
        capability: String,
    ) -> Self {
        Self {
            event_type: EventType::DependencyUnavailable,
            function_id: Some(function_id),
            dep_index: Some(dep_index),
            capability: Some(capability),
            ..Default::default()
        }
    }

    /// Create a "dependency_changed" event (endpoint or function changed)
    pub fn dependency_changed(
        function_id: String,
        dep_index: usize,
        capability: String,
        endpoint: String,
        function_name: String,
        agent_id: String,
    ) -> Self {
        Self {
            event_type: EventType::DependencyChanged,
            function_id: Some(function_id),
            dep_index: Some(dep_index),
            capability: Some(capability),
            endpoint: Some(endpoint),
            function_name: Some(function_name),
            agent_id: Some(agent_id),
            ..Default::default()
        }
    }

    /// Create an "llm_tools_updated" event
    pub fn llm_tools_updated(function_id: String, tools: Vec<LlmToolInfo>) -> Self {
        Self {
            event_type: EventType::LlmToolsUpdated,
            function_id: Some(function_id),
            tools: Some(tools),
            ..Default::default()
        }
    }

    /// Create an "llm_provider_available" event
    pub fn llm_provider_available(provider_info: LlmProviderInfo) -> Self {
        Self {
            event_type: EventType::LlmProviderAvailable,
            function_id: Some(provider_info.function_id.clone()),
            provider_info: Some(provider_info),
            ..Default::default()
        }
    }

    /// Create a "health_status_changed" event
    pub fn health_status_changed(status: HealthStatus) -> Self {
        Self {
            event_type: EventType::HealthStatusChanged,
            status: Some(status),
            ..Default::default()
        }
    }

    /// Create a "registry_connected" event
    pub fn registry_connected() -> Self {
        Self {
            event_type: EventType::RegistryConnected,
            ..Default::default()
        }
    }

    /// Create a "registry_disconnected" event
    pub fn registry_disconnected(reason: String) -> Self {
        Self {
            event_type: EventType::RegistryDisconnected,
            reason: Some(reason),
            ..Default::default()
        }
    }

    /// Create a "shutdown" event
    pub fn shutdown(reason: Option<String>) -> Self {
        Self {
            event_type: EventType::Shutdown,
            reason,
            ..Default::default()
        }
    }
}
