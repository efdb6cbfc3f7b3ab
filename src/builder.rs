//! Agent and tool builders.
//!
//! Without runtime reflection, users register tools explicitly: each tool
//! declares its exposed parameters (name/description/required plus schema),
//! its dependency slots, its LLM bindings, and a typed handler closure. The
//! builder turns those registrations into the immutable manifest, the
//! wrapper registry, and the LLM-config registry the runtime starts from.
//!
//! Routed HTTP endpoints register their dependencies through `route`, which
//! contributes a synthetic route-deps tool: resolvable by the registry,
//! never served over MCP.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::config::{resolve_config, resolve_config_int, ConfigKey};
use crate::error::{MeshError, Result};
use crate::manifest::{AgentManifest, DependencySpec, LlmBinding, Selector, ToolSpec};
use crate::mcp_client::{McpClient, ReturnHint};
use crate::proxy::{ProxyFactory, ToolProxy};
use crate::schema::{build_input_schema, ParamSpec};
use crate::wrapper::{ToolHandler, ToolInvocation, ToolWrapper};
use crate::wrappers::WrapperRegistry;

/// Builder for one tool registration.
pub struct ToolBuilder {
    function_name: String,
    component: Option<String>,
    capability: Option<String>,
    description: String,
    version: String,
    tags: Vec<String>,
    params: Vec<ParamSpec>,
    deps: Vec<(DependencySpec, ReturnHint)>,
    llms: Vec<LlmBinding>,
    handler: Option<ToolHandler>,
}

impl ToolBuilder {
    fn new(function_name: &str) -> Self {
        Self {
            function_name: function_name.to_string(),
            component: None,
            capability: None,
            description: String::new(),
            version: "1.0.0".to_string(),
            tags: Vec::new(),
            params: Vec::new(),
            deps: Vec::new(),
            llms: Vec::new(),
            handler: None,
        }
    }

    /// Component prefix for the function id (defaults to the agent name).
    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    /// Capability name for discovery (defaults to the function name).
    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Declare one exposed parameter.
    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    /// Declare a dependency slot. Declaration order defines the slot index.
    pub fn dependency(self, selector: Selector) -> Self {
        self.dependency_returning(selector, ReturnHint::Json)
    }

    /// Declare a dependency slot with a return-type hint for its proxy.
    pub fn dependency_returning(mut self, selector: Selector, hint: ReturnHint) -> Self {
        self.deps.push((DependencySpec::from_selector(selector), hint));
        self
    }

    /// Declare an LLM slot.
    pub fn llm(mut self, binding: LlmBinding) -> Self {
        self.llms.push(binding);
        self
    }

    /// Attach the handler closure invoked per dispatch.
    pub fn handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ToolInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |invocation| Box::pin(handler(invocation))));
        self
    }
}

/// Builder for a routed HTTP endpoint's dependency declarations.
pub struct RouteBuilder {
    name: String,
    deps: Vec<(DependencySpec, ReturnHint)>,
}

impl RouteBuilder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            deps: Vec::new(),
        }
    }

    /// Declare a dependency for the route, keyed by its parameter name.
    pub fn dependency(self, param_name: impl Into<String>, selector: Selector) -> Self {
        self.dependency_returning(param_name, selector, ReturnHint::Json)
    }

    pub fn dependency_returning(
        mut self,
        param_name: impl Into<String>,
        selector: Selector,
        hint: ReturnHint,
    ) -> Self {
        let mut spec = DependencySpec::from_selector(selector);
        spec.param_name = Some(param_name.into());
        self.deps.push((spec, hint));
        self
    }
}

/// Builder for a complete mesh agent.
pub struct AgentBuilder {
    name: String,
    version: String,
    description: String,
    http_host: Option<String>,
    http_port: Option<u16>,
    namespace: Option<String>,
    heartbeat_interval: Option<u64>,
    registry_url: Option<String>,
    tools: Vec<ToolBuilder>,
    routes: Vec<RouteBuilder>,
}

impl AgentBuilder {
    /// Start building an agent with the given name (overridable via
    /// MCP_MESH_AGENT_NAME).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "1.0.0".to_string(),
            description: String::new(),
            http_host: None,
            http_port: None,
            namespace: None,
            heartbeat_interval: None,
            registry_url: None,
            tools: Vec::new(),
            routes: Vec::new(),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn http_host(mut self, host: impl Into<String>) -> Self {
        self.http_host = Some(host.into());
        self
    }

    pub fn http_port(mut self, port: u16) -> Self {
        self.http_port = Some(port);
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn heartbeat_interval(mut self, seconds: u64) -> Self {
        self.heartbeat_interval = Some(seconds);
        self
    }

    pub fn registry_url(mut self, url: impl Into<String>) -> Self {
        self.registry_url = Some(url.into());
        self
    }

    /// Register a tool.
    pub fn tool<F>(mut self, function_name: &str, configure: F) -> Self
    where
        F: FnOnce(ToolBuilder) -> ToolBuilder,
    {
        self.tools.push(configure(ToolBuilder::new(function_name)));
        self
    }

    /// Register a routed endpoint's dependencies.
    pub fn route<F>(mut self, name: &str, configure: F) -> Self
    where
        F: FnOnce(RouteBuilder) -> RouteBuilder,
    {
        self.routes.push(configure(RouteBuilder::new(name)));
        self
    }

    /// Scan the registrations and assemble manifest, wrappers, and LLM
    /// configs.
    pub fn build(self) -> Result<AgentAssembly> {
        let name = resolve_config(ConfigKey::AgentName, Some(&self.name))
            .filter(|n| !n.is_empty())
            .ok_or_else(|| MeshError::Manifest("agent name is required".to_string()))?;

        let http_host = resolve_config(ConfigKey::HttpHost, self.http_host.as_deref())
            .unwrap_or_else(|| "localhost".to_string());
        let http_port = resolve_config_int(ConfigKey::HttpPort, self.http_port.map(i64::from))
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(0);
        let namespace = resolve_config(ConfigKey::Namespace, self.namespace.as_deref())
            .unwrap_or_else(|| "default".to_string());
        let heartbeat_interval =
            resolve_config_int(ConfigKey::HealthInterval, self.heartbeat_interval.map(|i| i as i64))
                .map(|i| i.max(1) as u64)
                .unwrap_or(5);
        let registry_url = resolve_config(ConfigKey::RegistryUrl, self.registry_url.as_deref())
            .unwrap_or_else(|| "http://localhost:8000".to_string());

        let agent_id = AgentManifest::generate_agent_id(&name);

        let factory = Arc::new(ProxyFactory::new(Arc::new(McpClient::new())));
        let registry = Arc::new(WrapperRegistry::new(factory));
        registry.set_agent_id(&agent_id);

        let mut specs = Vec::new();
        let mut llm_configs = HashMap::new();

        for tool in self.tools {
            let component = tool.component.as_deref().unwrap_or(&name);
            let function_id = format!("{}.{}", component, tool.function_name);
            let capability = tool
                .capability
                .clone()
                .unwrap_or_else(|| tool.function_name.clone());

            let handler = tool.handler.ok_or_else(|| {
                MeshError::Manifest(format!("tool '{}' has no handler", function_id))
            })?;

            let (dep_specs, dep_hints): (Vec<_>, Vec<_>) = tool.deps.into_iter().unzip();

            let spec = ToolSpec {
                function_id: function_id.clone(),
                function_name: tool.function_name.clone(),
                capability: capability.clone(),
                version: tool.version.clone(),
                tags: tool.tags.clone(),
                description: tool.description.clone(),
                dependencies: dep_specs.clone(),
                input_schema: Some(build_input_schema(&tool.params)),
                llm_bindings: tool.llms.clone(),
                route_only: false,
            };

            if let Some(binding) = tool.llms.first() {
                llm_configs.insert(function_id.clone(), binding.clone());
            }

            let wrapper = Arc::new(ToolWrapper::new(
                function_id,
                capability,
                tool.description,
                tool.params,
                dep_specs,
                dep_hints,
                tool.llms.len(),
                handler,
            ));
            registry.register(wrapper, true);
            specs.push(spec);
        }

        for route in self.routes {
            let function_id = format!("{}.{}_route_deps", name, route.name);
            let capability = format!("{}-route-deps", route.name);
            let (dep_specs, dep_hints): (Vec<_>, Vec<_>) = route.deps.into_iter().unzip();

            let spec = ToolSpec {
                function_id: function_id.clone(),
                function_name: format!("{}_route_deps", route.name),
                capability: capability.clone(),
                version: self.version.clone(),
                tags: Vec::new(),
                description: format!("Dependency slots for route '{}'", route.name),
                dependencies: dep_specs.clone(),
                input_schema: None,
                llm_bindings: Vec::new(),
                route_only: true,
            };

            let wrapper = Arc::new(ToolWrapper::new(
                function_id,
                capability,
                spec.description.clone(),
                Vec::new(),
                dep_specs,
                dep_hints,
                0,
                route_stub_handler(),
            ));
            registry.register(wrapper, false);
            specs.push(spec);
        }

        let manifest = AgentManifest {
            name,
            agent_id,
            version: self.version,
            description: self.description,
            registry_url,
            http_host,
            http_port,
            namespace,
            heartbeat_interval,
            tools: specs,
        };
        manifest.validate()?;

        info!(
            "Manifest built for '{}': {} tools, {} LLM-bound functions",
            manifest.agent_id,
            manifest.tools.len(),
            llm_configs.len()
        );

        Ok(AgentAssembly {
            manifest,
            registry,
            llm_configs,
        })
    }
}

/// Route-deps wrappers are never dispatched; the stub guards against it.
fn route_stub_handler() -> ToolHandler {
    Arc::new(|_invocation: ToolInvocation| {
        Box::pin(async {
            Err(MeshError::InvalidArgument(
                "route-deps tools are not callable".to_string(),
            ))
        })
    })
}

/// Output of a successful build: everything the lifecycle needs to start.
#[derive(Debug)]
pub struct AgentAssembly {
    /// Immutable registration manifest
    pub manifest: AgentManifest,

    /// Wrapper registry (dispatch + slot updates)
    pub registry: Arc<WrapperRegistry>,

    /// LLM binding per owning function id
    pub llm_configs: HashMap<String, LlmBinding>,
}

impl AgentAssembly {
    /// Proxy accessor for a routed endpoint's dependencies, keyed by the
    /// parameter names declared on the route.
    pub fn route_proxies(&self, route_name: &str) -> Option<RouteProxies> {
        let function_id = format!("{}.{}_route_deps", self.manifest.name, route_name);
        self.registry
            .wrapper(&function_id)
            .map(|wrapper| RouteProxies { wrapper })
    }
}

/// Live view of a route's resolved dependency proxies.
pub struct RouteProxies {
    wrapper: Arc<crate::wrapper::ToolWrapper>,
}

impl RouteProxies {
    /// Current proxy for a route parameter, None while unresolved.
    pub fn get(&self, param_name: &str) -> Option<Arc<ToolProxy>> {
        let index = self
            .wrapper
            .dep_specs()
            .iter()
            .position(|d| d.param_name.as_deref() == Some(param_name))?;
        self.wrapper.dep(index)
    }
}
