//! Typed proxies for remote mesh tools.
//!
//! A proxy is a stable reference that remote-invokes a named function at a
//! rebindable endpoint. The factory caches proxies by (endpoint, function)
//! so every caller that refers to the same remote function shares one
//! reference; topology churn mutates proxy state in place and never swaps
//! the reference out from under an in-flight dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{MeshError, Result};
use crate::mcp_client::{McpClient, ReturnHint};

/// Proxy for one remote tool function.
///
/// Endpoint and availability are mutable behind the reference; the function
/// name and return-type hint are fixed at creation.
pub struct ToolProxy {
    function_name: String,
    endpoint: RwLock<String>,
    available: AtomicBool,
    hint: ReturnHint,
    client: Arc<McpClient>,
}

impl ToolProxy {
    fn new(
        endpoint: String,
        function_name: String,
        hint: ReturnHint,
        client: Arc<McpClient>,
    ) -> Self {
        Self {
            function_name,
            endpoint: RwLock::new(endpoint),
            available: AtomicBool::new(false),
            hint,
            client,
        }
    }

    /// Remote function name this proxy invokes.
    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Current endpoint.
    pub fn endpoint(&self) -> String {
        self.endpoint.read().map(|e| e.clone()).unwrap_or_default()
    }

    /// Whether the remote function currently has an active endpoint.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub(crate) fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub(crate) fn rebind(&self, endpoint: &str) {
        if let Ok(mut current) = self.endpoint.write() {
            *current = endpoint.to_string();
        }
    }

    /// Invoke with no arguments.
    pub async fn call(&self) -> Result<Value> {
        self.call_map(Value::Object(Map::new())).await
    }

    /// Invoke with an argument map.
    pub async fn call_map(&self, arguments: Value) -> Result<Value> {
        if !self.is_available() {
            return Err(MeshError::ToolUnavailable(self.function_name.clone()));
        }
        let endpoint = self.endpoint();
        if endpoint.is_empty() {
            return Err(MeshError::ToolUnavailable(self.function_name.clone()));
        }

        let arguments = crate::trace::with_propagated_headers(arguments);
        self.client
            .call_tool(&endpoint, &self.function_name, arguments, self.hint)
            .await
    }

    /// Invoke with key/value pairs.
    pub async fn call_kv<K, I>(&self, pairs: I) -> Result<Value>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut map = Map::new();
        for (key, value) in pairs {
            map.insert(key.into(), value);
        }
        self.call_map(Value::Object(map)).await
    }

    /// Invoke with a single record argument, converted field-wise to the
    /// params map.
    pub async fn call_record<T: Serialize>(&self, record: &T) -> Result<Value> {
        let value = serde_json::to_value(record)?;
        match value {
            Value::Object(_) => self.call_map(value).await,
            other => Err(MeshError::InvalidArgument(format!(
                "record argument must serialize to an object, got: {}",
                other
            ))),
        }
    }

    /// Invoke with an argument map and deserialize the result.
    pub async fn call_as<T: DeserializeOwned>(&self, arguments: Value) -> Result<T> {
        let result = self.call_map(arguments).await?;
        Ok(serde_json::from_value(result)?)
    }
}

impl std::fmt::Debug for ToolProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolProxy")
            .field("function_name", &self.function_name)
            .field("endpoint", &self.endpoint())
            .field("available", &self.is_available())
            .finish()
    }
}

/// Cache of tool proxies keyed by (endpoint, function name).
///
/// A key resolves to the same `Arc` for the lifetime of the agent;
/// invalidation marks the proxy unavailable without reallocating while the
/// key persists.
pub struct ProxyFactory {
    client: Arc<McpClient>,
    cache: RwLock<HashMap<(String, String), Arc<ToolProxy>>>,
}

impl ProxyFactory {
    pub fn new(client: Arc<McpClient>) -> Self {
        Self {
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Shared HTTP client, also used by LLM agents for provider calls.
    pub fn client(&self) -> Arc<McpClient> {
        self.client.clone()
    }

    /// Get or create the proxy for (endpoint, function).
    ///
    /// Newly created proxies start unavailable; `update` flips them live.
    pub fn get_or_create(
        &self,
        endpoint: &str,
        function_name: &str,
        hint: ReturnHint,
    ) -> Arc<ToolProxy> {
        let key = (endpoint.to_string(), function_name.to_string());
        if let Some(existing) = self.cache.read().ok().and_then(|c| c.get(&key).cloned()) {
            return existing;
        }

        let mut cache = match self.cache.write() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache
            .entry(key)
            .or_insert_with(|| {
                Arc::new(ToolProxy::new(
                    endpoint.to_string(),
                    function_name.to_string(),
                    hint,
                    self.client.clone(),
                ))
            })
            .clone()
    }

    /// Mark the proxy for (endpoint, function) available, creating it if
    /// needed, and return it.
    pub fn update(&self, endpoint: &str, function_name: &str, hint: ReturnHint) -> Arc<ToolProxy> {
        let proxy = self.get_or_create(endpoint, function_name, hint);
        proxy.rebind(endpoint);
        proxy.set_available(true);
        debug!("Proxy for '{}' now at {}", function_name, endpoint);
        proxy
    }

    /// Re-point an existing proxy at a new endpoint, preserving its
    /// identity, and alias the new key to the same reference.
    pub fn rebind_existing(&self, proxy: &Arc<ToolProxy>, endpoint: &str) {
        proxy.rebind(endpoint);
        proxy.set_available(true);

        let key = (endpoint.to_string(), proxy.function_name().to_string());
        let mut cache = match self.cache.write() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Per-key identity: only alias when the key is unclaimed
        cache.entry(key).or_insert_with(|| proxy.clone());
    }

    /// Mark the proxy for (endpoint, function) unavailable, if cached.
    pub fn mark_unavailable(&self, endpoint: &str, function_name: &str) {
        let key = (endpoint.to_string(), function_name.to_string());
        if let Some(proxy) = self.cache.read().ok().and_then(|c| c.get(&key).cloned()) {
            proxy.set_available(false);
            debug!("Proxy for '{}' at {} marked unavailable", function_name, endpoint);
        }
    }

    /// Mark unavailable and drop the cache key.
    pub fn invalidate(&self, endpoint: &str, function_name: &str) {
        let key = (endpoint.to_string(), function_name.to_string());
        let removed = {
            let mut cache = match self.cache.write() {
                Ok(cache) => cache,
                Err(poisoned) => poisoned.into_inner(),
            };
            cache.remove(&key)
        };
        if let Some(proxy) = removed {
            proxy.set_available(false);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn factory() -> ProxyFactory {
        ProxyFactory::new(Arc::new(McpClient::new()))
    }

    #[test]
    fn test_get_or_create_is_reference_stable() {
        let factory = factory();
        let a = factory.get_or_create("http://m:9000", "multiply", ReturnHint::Integer);
        let b = factory.get_or_create("http://m:9000", "multiply", ReturnHint::Integer);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.len(), 1);
    }

    #[test]
    fn test_new_proxy_starts_unavailable() {
        let factory = factory();
        let proxy = factory.get_or_create("http://m:9000", "multiply", ReturnHint::Json);
        assert!(!proxy.is_available());

        let updated = factory.update("http://m:9000", "multiply", ReturnHint::Json);
        assert!(Arc::ptr_eq(&proxy, &updated));
        assert!(proxy.is_available());
    }

    #[test]
    fn test_rebind_preserves_identity() {
        let factory = factory();
        let proxy = factory.update("http://m:9000", "multiply", ReturnHint::Json);

        factory.rebind_existing(&proxy, "http://m2:9000");
        assert_eq!(proxy.endpoint(), "http://m2:9000");
        assert!(proxy.is_available());

        // The aliased key resolves to the same reference
        let aliased = factory.get_or_create("http://m2:9000", "multiply", ReturnHint::Json);
        assert!(Arc::ptr_eq(&proxy, &aliased));
    }

    #[test]
    fn test_mark_unavailable_keeps_reference() {
        let factory = factory();
        let proxy = factory.update("http://m:9000", "multiply", ReturnHint::Json);
        factory.mark_unavailable("http://m:9000", "multiply");

        assert!(!proxy.is_available());
        let again = factory.get_or_create("http://m:9000", "multiply", ReturnHint::Json);
        assert!(Arc::ptr_eq(&proxy, &again));
    }

    #[test]
    fn test_invalidate_removes_key() {
        let factory = factory();
        let proxy = factory.update("http://m:9000", "multiply", ReturnHint::Json);
        factory.invalidate("http://m:9000", "multiply");

        assert!(!proxy.is_available());
        assert_eq!(factory.len(), 0);
    }

    #[tokio::test]
    async fn test_call_unavailable_proxy() {
        let factory = factory();
        let proxy = factory.get_or_create("http://m:9000", "multiply", ReturnHint::Json);

        let err = proxy.call_map(json!({"x": 1})).await.unwrap_err();
        match err {
            MeshError::ToolUnavailable(name) => assert_eq!(name, "multiply"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_record_requires_object() {
        let factory = factory();
        let proxy = factory.update("http://m:9000", "multiply", ReturnHint::Json);

        let err = proxy.call_record(&42).await.unwrap_err();
        assert!(matches!(err, MeshError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_call_dispatches_to_endpoint() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/mcp")
            .with_status(200)
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":{"content":[{"text":"6"}]}}"#)
            .create_async()
            .await;

        let factory = factory();
        let proxy = factory.update(&server.url(), "multiply", ReturnHint::Integer);
        let result = proxy.call_kv([("x", json!(2)), ("y", json!(3))]).await.unwrap();
        assert_eq!(result, json!(6));
    }
}
