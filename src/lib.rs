//! Rust SDK runtime for MCP Mesh agents.
//!
//! An agent registers its tools with the mesh registry, discovers peers by
//! heartbeat, and exchanges calls over MCP JSON-RPC. The SDK hides the
//! cluster: register tool handlers on a builder, start the agent, and the
//! runtime keeps typed proxies for remote tools and LLM agent proxies wired
//! to the live topology.
//!
//! ```no_run
//! use mcp_mesh_agent::{AgentBuilder, MeshAgent, ParamSpec, ReturnHint, Selector};
//! use serde_json::json;
//!
//! # async fn example() -> mcp_mesh_agent::Result<()> {
//! let assembly = AgentBuilder::new("calc")
//!     .tool("add", |t| {
//!         t.capability("calc-add")
//!             .description("Adds two integers")
//!             .param(ParamSpec::integer("a"))
//!             .param(ParamSpec::integer("b"))
//!             .dependency_returning(Selector::capability("mul"), ReturnHint::Integer)
//!             .handler(|inv| async move {
//!                 let a: i64 = inv.arg("a")?;
//!                 let b: i64 = inv.arg("b")?;
//!                 // dep(0) is None until the mesh resolves it
//!                 Ok(json!(a + b))
//!             })
//!     })
//!     .build()?;
//!
//! let agent = MeshAgent::start(assembly).await?;
//! # agent.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod config;
pub mod error;
pub mod events;
pub mod handle;
pub mod heartbeat;
pub mod lifecycle;
pub mod llm;
pub mod manifest;
pub mod mcp_client;
pub mod processor;
pub mod proxy;
pub mod registry;
pub mod runtime;
pub mod schema;
pub mod server;
pub mod trace;
pub mod tracing_publish;
pub mod wrapper;
pub mod wrappers;

pub use builder::{AgentAssembly, AgentBuilder, RouteProxies, ToolBuilder};
pub use error::{MeshError, Result};
pub use events::{HealthStatus, LlmToolInfo, MeshEvent};
pub use lifecycle::{MeshAgent, StartOptions};
pub use llm::{ContextMode, GenerateRequest, LlmAgent};
pub use manifest::{AgentManifest, DependencySpec, LlmBinding, Selector, ToolSpec};
pub use mcp_client::{McpClient, ReturnHint};
pub use proxy::{ProxyFactory, ToolProxy};
pub use schema::ParamSpec;
pub use wrapper::{ToolInvocation, ToolWrapper};
pub use wrappers::WrapperRegistry;

use tracing_subscriber::EnvFilter;

/// Initialize logging from mesh configuration.
///
/// `MCP_MESH_DEBUG` / `MCP_MESH_LOG_LEVEL` pick the default level; `RUST_LOG`
/// still wins when set. Safe to call more than once.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config::log_filter()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
