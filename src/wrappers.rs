//! Authoritative registry of tool wrappers.
//!
//! Four indexes: function id and method name resolve wrappers for topology
//! events (some registries publish short names); capability and method name
//! resolve dispatch handlers for the MCP server. Handlers are the subset of
//! wrappers that are actually served - route-only wrappers exist for
//! dependency resolution but are never dispatched over MCP.
//!
//! Slot updates arrive as composite keys `"<funcId>:dep_<i>"` and
//! `"<funcId>:llm_<j>"`. Invalid keys are logged and ignored; topology noise
//! must never take the registry down.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{MeshError, Result};
use crate::llm::{LlmAgent, LocalToolDispatch};
use crate::proxy::ProxyFactory;
use crate::wrapper::ToolWrapper;

/// Slot kind parsed from a composite key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Dep,
    Llm,
}

/// Parse `"<funcId>:dep_<i>"` / `"<funcId>:llm_<j>"`.
pub fn parse_slot_key(key: &str) -> Option<(&str, SlotKind, usize)> {
    let (function_id, slot) = key.rsplit_once(':')?;
    if function_id.is_empty() {
        return None;
    }
    if let Some(index) = slot.strip_prefix("dep_") {
        return index.parse().ok().map(|i| (function_id, SlotKind::Dep, i));
    }
    if let Some(index) = slot.strip_prefix("llm_") {
        return index.parse().ok().map(|i| (function_id, SlotKind::Llm, i));
    }
    None
}

/// Registry mapping names to wrappers and dispatch handlers.
pub struct WrapperRegistry {
    factory: Arc<ProxyFactory>,
    agent_id: RwLock<String>,
    wrappers: RwLock<HashMap<String, Arc<ToolWrapper>>>,
    wrappers_by_method: RwLock<HashMap<String, Arc<ToolWrapper>>>,
    handlers: RwLock<HashMap<String, Arc<ToolWrapper>>>,
    handlers_by_method: RwLock<HashMap<String, Arc<ToolWrapper>>>,
}

impl WrapperRegistry {
    pub fn new(factory: Arc<ProxyFactory>) -> Self {
        Self {
            factory,
            agent_id: RwLock::new(String::new()),
            wrappers: RwLock::new(HashMap::new()),
            wrappers_by_method: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            handlers_by_method: RwLock::new(HashMap::new()),
        }
    }

    pub fn factory(&self) -> Arc<ProxyFactory> {
        self.factory.clone()
    }

    pub fn set_agent_id(&self, agent_id: &str) {
        if let Ok(mut id) = self.agent_id.write() {
            *id = agent_id.to_string();
        }
    }

    /// Register a wrapper under all applicable indexes.
    ///
    /// `serve` is false for route-only wrappers: resolvable, not
    /// dispatchable.
    pub fn register(&self, wrapper: Arc<ToolWrapper>, serve: bool) {
        let function_id = wrapper.function_id().to_string();
        let method_name = wrapper.method_name().to_string();

        if let Ok(mut map) = self.wrappers.write() {
            map.insert(function_id, wrapper.clone());
        }
        if let Ok(mut map) = self.wrappers_by_method.write() {
            map.insert(method_name.clone(), wrapper.clone());
        }
        if serve {
            if let Ok(mut map) = self.handlers.write() {
                map.insert(wrapper.capability().to_string(), wrapper.clone());
            }
            if let Ok(mut map) = self.handlers_by_method.write() {
                map.insert(method_name, wrapper);
            }
        }
    }

    /// Resolve a wrapper for a topology event: function id first, short
    /// method name second.
    pub fn wrapper(&self, name: &str) -> Option<Arc<ToolWrapper>> {
        if let Some(wrapper) = self.wrappers.read().ok().and_then(|m| m.get(name).cloned()) {
            return Some(wrapper);
        }
        let short = name.rsplit('.').next().unwrap_or(name);
        self.wrappers_by_method
            .read()
            .ok()
            .and_then(|m| m.get(short).cloned())
    }

    /// Resolve a dispatch handler: capability first, method name second.
    pub fn handler(&self, name: &str) -> Option<Arc<ToolWrapper>> {
        if let Some(handler) = self.handlers.read().ok().and_then(|m| m.get(name).cloned()) {
            return Some(handler);
        }
        self.handlers_by_method
            .read()
            .ok()
            .and_then(|m| m.get(name).cloned())
    }

    /// All dispatchable handlers.
    pub fn handlers(&self) -> Vec<Arc<ToolWrapper>> {
        self.handlers
            .read()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// All registered wrappers, including route-only ones.
    pub fn wrappers(&self) -> Vec<Arc<ToolWrapper>> {
        self.wrappers
            .read()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// `tools/list` payload for the MCP server.
    pub fn tool_listing(&self) -> Value {
        let tools: Vec<Value> = self
            .handlers()
            .iter()
            .map(|w| {
                json!({
                    "name": w.capability(),
                    "description": w.description(),
                    "inputSchema": w.input_schema().clone(),
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    /// Point a dependency slot at an endpoint.
    ///
    /// The existing proxy is re-bound in place when the remote function is
    /// unchanged, so wrappers never observe a reference swap on endpoint
    /// moves; otherwise a (possibly cached) proxy for the new key is
    /// installed.
    pub fn update_dependency(&self, key: &str, endpoint: &str, function_name: &str) {
        let Some((function_id, SlotKind::Dep, index)) = parse_slot_key(key) else {
            warn!("Ignoring invalid dependency key '{}'", key);
            return;
        };
        let Some(wrapper) = self.wrapper(function_id) else {
            warn!("Ignoring dependency update for unknown function '{}'", function_id);
            return;
        };
        if index >= wrapper.dep_count() {
            warn!(
                "Ignoring dependency update for '{}': index {} out of range",
                function_id, index
            );
            return;
        }

        match wrapper.dep(index) {
            Some(existing) if existing.function_name() == function_name => {
                self.factory.rebind_existing(&existing, endpoint);
                debug!(
                    "Rebound dep {} of '{}' to {}",
                    index, function_id, endpoint
                );
            }
            _ => {
                let hint = wrapper.dep_hint(index);
                let proxy = self.factory.update(endpoint, function_name, hint);
                wrapper.set_dep(index, Some(proxy));
                debug!(
                    "Resolved dep {} of '{}' to '{}' at {}",
                    index, function_id, function_name, endpoint
                );
            }
        }
    }

    /// Null out a dependency slot.
    ///
    /// The slot is cleared before the proxy is marked unavailable, so no
    /// dispatch can observe a live slot holding an unavailable proxy.
    pub fn mark_dependency_unavailable(&self, key: &str) {
        let Some((function_id, SlotKind::Dep, index)) = parse_slot_key(key) else {
            warn!("Ignoring invalid dependency key '{}'", key);
            return;
        };
        let Some(wrapper) = self.wrapper(function_id) else {
            warn!("Ignoring dependency removal for unknown function '{}'", function_id);
            return;
        };

        let previous = wrapper.dep(index);
        wrapper.set_dep(index, None);
        if let Some(proxy) = previous {
            proxy.set_available(false);
        }
        debug!("Cleared dep {} of '{}'", index, function_id);
    }

    /// Write an LLM agent into a slot.
    pub fn update_llm_agent(&self, key: &str, agent: Arc<LlmAgent>) {
        let Some((function_id, SlotKind::Llm, index)) = parse_slot_key(key) else {
            warn!("Ignoring invalid LLM key '{}'", key);
            return;
        };
        let Some(wrapper) = self.wrapper(function_id) else {
            warn!("Ignoring LLM update for unknown function '{}'", function_id);
            return;
        };
        if index >= wrapper.llm_count() {
            warn!(
                "Ignoring LLM update for '{}': index {} out of range",
                function_id, index
            );
            return;
        }
        wrapper.set_llm(index, Some(agent));
        debug!("LLM slot {} of '{}' updated", index, function_id);
    }
}

#[async_trait]
impl LocalToolDispatch for WrapperRegistry {
    fn agent_id(&self) -> String {
        self.agent_id.read().map(|id| id.clone()).unwrap_or_default()
    }

    async fn dispatch_local(&self, name: &str, arguments: Value) -> Result<Value> {
        let handler = self
            .handler(name)
            .ok_or_else(|| MeshError::ToolCallFailed {
                function: name.to_string(),
                message: "no local handler".to_string(),
            })?;
        handler.invoke(arguments).await
    }
}

impl std::fmt::Debug for WrapperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrapperRegistry")
            .field("wrappers", &self.wrappers().len())
            .field("handlers", &self.handlers().len())
            .finish()
    }
}
