//! Manifest types for mesh agents.
//!
//! The manifest is produced once at startup by the builder and is immutable
//! afterwards. It drives registration with the registry and gives the mesh
//! core the per-tool dependency declarations it diffs topology against.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MeshError;

/// Selector used for dependency discovery and LLM provider/filter matching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selector {
    /// Capability name to match
    pub capability: String,

    /// Tags for filtering (e.g., ["+fast", "-deprecated"])
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Version constraint (e.g., ">=2.0.0")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Selector {
    /// Selector matching a capability with no tag or version constraints.
    pub fn capability(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            ..Default::default()
        }
    }

    /// Add a tag constraint.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Add a version constraint.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Specification of one dependency slot declared by a tool.
///
/// Declaration order defines the dependency index used in composite slot
/// keys, so the list on [`ToolSpec`] is ordered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencySpec {
    /// Capability name to depend on
    pub capability: String,

    /// Tags for filtering
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Version constraint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Parameter name, set for routed HTTP endpoints whose dependencies are
    /// exposed through a synthetic route-deps tool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_name: Option<String>,
}

impl DependencySpec {
    /// Dependency on a capability with no constraints.
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            ..Default::default()
        }
    }

    /// Build from a selector.
    pub fn from_selector(selector: Selector) -> Self {
        Self {
            capability: selector.capability,
            tags: selector.tags,
            version: selector.version,
            param_name: None,
        }
    }
}

/// Filter mode for LLM tool discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Every tool matching the filter
    #[default]
    All,
    /// Only the single best match per capability
    BestMatch,
    /// Every tool in the namespace
    Wildcard,
}

/// LLM binding declared by a tool that takes an LLM-agent slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmBinding {
    /// Provider selector (which LLM provider capability to bind)
    pub provider: Selector,

    /// Tool filter selectors (which mesh tools the model may call)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Selector>,

    /// Filter mode
    #[serde(default)]
    pub filter_mode: FilterMode,

    /// System prompt template; `${var}` placeholders are rendered from the
    /// invocation context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Name of the exposed parameter whose value becomes the template
    /// rendering context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_param: Option<String>,

    /// Maximum agentic loop iterations
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Default model params applied when a request leaves them unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,

    /// Statically configured provider endpoint (direct mode); usable before
    /// any registry resolution happens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct: Option<DirectProvider>,
}

/// Provider endpoint known at configuration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectProvider {
    pub endpoint: String,
    pub function_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn default_max_iterations() -> u32 {
    10
}

impl LlmBinding {
    /// Binding against a provider capability with defaults.
    pub fn provider(selector: Selector) -> Self {
        Self {
            provider: selector,
            max_iterations: default_max_iterations(),
            ..Default::default()
        }
    }
}

/// Specification for one tool advertised by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Function id `<component>.<function>` - unique within the process
    pub function_id: String,

    /// Function name (the `<function>` part of the id)
    pub function_name: String,

    /// Capability name for discovery, unique within the agent
    pub capability: String,

    /// Version of this capability
    pub version: String,

    /// Tags for filtering
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Ordered dependency declarations; index == slot index
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencySpec>,

    /// JSON Schema for the exposed input parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,

    /// LLM bindings, one per declared LLM slot, in declaration order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub llm_bindings: Vec<LlmBinding>,

    /// Set for the synthetic route-deps tool: the tool is registered for
    /// dependency resolution but not served over MCP
    #[serde(default)]
    pub route_only: bool,
}

/// Complete registration manifest for a mesh agent.
///
/// Built once at startup; immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentManifest {
    /// User-supplied agent name
    pub name: String,

    /// Process-unique agent id: `<name>-<8 hex>`
    pub agent_id: String,

    /// Agent version (semver)
    pub version: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Registry URL
    pub registry_url: String,

    /// HTTP host announced to the registry
    pub http_host: String,

    /// HTTP port (0 = assigned by the server at bind time)
    pub http_port: u16,

    /// Namespace for isolation
    pub namespace: String,

    /// Heartbeat interval in seconds
    pub heartbeat_interval: u64,

    /// Tools advertised by this agent
    pub tools: Vec<ToolSpec>,
}

impl AgentManifest {
    /// Generate the process-unique agent id for `name`.
    ///
    /// The 8-hex suffix prevents cross-restart collision at the registry.
    pub fn generate_agent_id(name: &str) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}", name, &suffix[..8])
    }

    /// Validate manifest-wide invariants.
    ///
    /// Capability names must be unique per agent; function ids must be
    /// unique per process.
    pub fn validate(&self) -> Result<(), MeshError> {
        let mut capabilities = std::collections::HashSet::new();
        let mut function_ids = std::collections::HashSet::new();

        for tool in &self.tools {
            if !capabilities.insert(tool.capability.as_str()) {
                return Err(MeshError::Manifest(format!(
                    "duplicate capability '{}'",
                    tool.capability
                )));
            }
            if !function_ids.insert(tool.function_id.as_str()) {
                return Err(MeshError::Manifest(format!(
                    "duplicate function id '{}'",
                    tool.function_id
                )));
            }
        }
        Ok(())
    }

    /// Look up a tool spec by function id.
    pub fn tool(&self, function_id: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.function_id == function_id)
    }

    /// All dependency capabilities declared across tools, deduplicated.
    pub fn all_dependencies(&self) -> Vec<String> {
        let mut deps: Vec<String> = self
            .tools
            .iter()
            .flat_map(|t| t.dependencies.iter().map(|d| d.capability.clone()))
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(function_id: &str, capability: &str) -> ToolSpec {
        ToolSpec {
            function_id: function_id.to_string(),
            function_name: function_id.split('.').next_back().unwrap().to_string(),
            capability: capability.to_string(),
            version: "1.0.0".to_string(),
            tags: Vec::new(),
            description: String::new(),
            dependencies: Vec::new(),
            input_schema: None,
            llm_bindings: Vec::new(),
            route_only: false,
        }
    }

    fn manifest(tools: Vec<ToolSpec>) -> AgentManifest {
        AgentManifest {
            name: "test-agent".to_string(),
            agent_id: AgentManifest::generate_agent_id("test-agent"),
            version: "1.0.0".to_string(),
            description: String::new(),
            registry_url: "http://localhost:8000".to_string(),
            http_host: "localhost".to_string(),
            http_port: 9000,
            namespace: "default".to_string(),
            heartbeat_interval: 5,
            tools,
        }
    }

    #[test]
    fn test_agent_id_suffix() {
        let id = AgentManifest::generate_agent_id("calc");
        assert!(id.starts_with("calc-"));
        let suffix = id.strip_prefix("calc-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));

        // Distinct per call
        assert_ne!(id, AgentManifest::generate_agent_id("calc"));
    }

    #[test]
    fn test_duplicate_capability_fails_validation() {
        let m = manifest(vec![tool("calc.add", "math"), tool("calc.sub", "math")]);
        let err = m.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate capability 'math'"));
    }

    #[test]
    fn test_duplicate_function_id_fails_validation() {
        let m = manifest(vec![tool("calc.add", "add"), tool("calc.add", "plus")]);
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_valid_manifest() {
        let m = manifest(vec![tool("calc.add", "add"), tool("calc.mul", "mul")]);
        assert!(m.validate().is_ok());
        assert!(m.tool("calc.mul").is_some());
        assert!(m.tool("calc.div").is_none());
    }

    #[test]
    fn test_all_dependencies_deduplicated() {
        let mut a = tool("calc.add", "add");
        a.dependencies = vec![
            DependencySpec::new("date-service"),
            DependencySpec::new("weather-service"),
        ];
        let mut b = tool("calc.mul", "mul");
        b.dependencies = vec![DependencySpec::new("date-service")];

        let m = manifest(vec![a, b]);
        assert_eq!(m.all_dependencies(), vec!["date-service", "weather-service"]);
    }

    #[test]
    fn test_selector_builder() {
        let s = Selector::capability("llm-provider")
            .with_tag("+fast")
            .with_version(">=1.0.0");
        assert_eq!(s.capability, "llm-provider");
        assert_eq!(s.tags, vec!["+fast"]);
        assert_eq!(s.version.as_deref(), Some(">=1.0.0"));
    }
}
