//! Handle to the running mesh core.
//!
//! Starting the core spawns the runtime loop and returns a handle offering
//! the four core operations: poll the event stream, query state, report
//! health, and request shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;

use crate::events::{HealthStatus, MeshEvent};
use crate::manifest::AgentManifest;
use crate::registry::RegistryError;
use crate::runtime::{CoreRuntime, RuntimeCommand, RuntimeConfig};

/// State shared between the handle and the runtime loop.
#[derive(Debug, Default)]
pub struct CoreState {
    /// Resolved dependency endpoints (capability -> endpoint)
    pub dependencies: HashMap<String, String>,

    /// Current health status
    pub health_status: HealthStatus,

    /// Whether the last heartbeat landed
    pub registered: bool,

    /// Agent id echoed back by the registry
    pub registry_agent_id: Option<String>,

    /// Whether shutdown has been requested
    pub shutdown_requested: bool,
}

/// Handle to a running mesh core.
pub struct CoreHandle {
    event_rx: Mutex<mpsc::Receiver<MeshEvent>>,
    state: Arc<RwLock<CoreState>>,
    shutdown_tx: mpsc::Sender<()>,
    command_tx: mpsc::Sender<RuntimeCommand>,
}

impl CoreHandle {
    /// Start the mesh core for a manifest.
    ///
    /// Spawns the runtime loop on the current tokio runtime; registration
    /// and event production begin in the background immediately.
    pub fn start(manifest: AgentManifest, config: RuntimeConfig) -> Result<Self, RegistryError> {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer_size);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (command_tx, command_rx) = mpsc::channel(8);
        let state = Arc::new(RwLock::new(CoreState::default()));

        let runtime = CoreRuntime::new(
            manifest,
            config,
            event_tx,
            state.clone(),
            shutdown_rx,
            command_rx,
        )?;
        tokio::spawn(runtime.run());

        Ok(Self {
            event_rx: Mutex::new(event_rx),
            state,
            shutdown_tx,
            command_tx,
        })
    }

    /// Wait for the next event; None means the runtime is gone.
    pub async fn next_event(&self) -> Option<MeshEvent> {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await
    }

    /// Bounded poll for the next event.
    ///
    /// Returns None on timeout; a closed channel yields a final shutdown
    /// event so consumers always observe termination.
    pub async fn poll_event(&self, timeout: Duration) -> Option<MeshEvent> {
        let mut rx = self.event_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(event)) => Some(event),
            Ok(None) => Some(MeshEvent::shutdown(Some("event channel closed".to_string()))),
            Err(_) => None,
        }
    }

    /// Snapshot of resolved dependency endpoints.
    pub async fn dependencies(&self) -> HashMap<String, String> {
        self.state.read().await.dependencies.clone()
    }

    /// Current health status.
    pub async fn health_status(&self) -> HealthStatus {
        self.state.read().await.health_status
    }

    /// Whether the agent currently holds a registration.
    pub async fn is_registered(&self) -> bool {
        self.state.read().await.registered
    }

    /// Agent id as assigned by the registry, once registered.
    pub async fn registry_agent_id(&self) -> Option<String> {
        self.state.read().await.registry_agent_id.clone()
    }

    /// Whether shutdown has been requested.
    pub async fn is_shutdown_requested(&self) -> bool {
        self.state.read().await.shutdown_requested
    }

    /// Report a new health status to the core.
    ///
    /// The status rides on the next heartbeat and drives the health probe.
    pub async fn report_health(&self, status: HealthStatus) {
        {
            let mut state = self.state.write().await;
            state.health_status = status;
        }
        let _ = self.command_tx.send(RuntimeCommand::SetHealth(status)).await;
    }

    /// Request graceful shutdown.
    ///
    /// Non-blocking; the event stream ends with a shutdown event once the
    /// runtime has unregistered.
    pub async fn shutdown(&self) {
        debug!("Core shutdown requested");
        {
            let mut state = self.state.write().await;
            state.shutdown_requested = true;
        }
        let _ = self.shutdown_tx.try_send(());
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn test_handle() -> (CoreHandle, mpsc::Sender<MeshEvent>, mpsc::Receiver<()>) {
        let (event_tx, event_rx) = mpsc::channel(10);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (command_tx, _command_rx) = mpsc::channel(8);
        let handle = test_support::handle_from_parts(event_rx, shutdown_tx, command_tx);
        (handle, event_tx, shutdown_rx)
    }

    #[tokio::test]
    async fn test_poll_event_times_out() {
        let (handle, _event_tx, _shutdown_rx) = test_handle();
        let event = handle.poll_event(Duration::from_millis(20)).await;
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn test_poll_event_delivers() {
        let (handle, event_tx, _shutdown_rx) = test_handle();
        event_tx
            .send(MeshEvent::agent_registered("calc-1a2b3c4d".to_string()))
            .await
            .unwrap();

        let event = handle.poll_event(Duration::from_secs(1)).await.unwrap();
        assert_eq!(event.agent_id.as_deref(), Some("calc-1a2b3c4d"));
    }

    #[tokio::test]
    async fn test_closed_channel_yields_shutdown() {
        let (handle, event_tx, _shutdown_rx) = test_handle();
        drop(event_tx);

        let event = handle.poll_event(Duration::from_secs(1)).await.unwrap();
        assert_eq!(event.event_type, crate::events::EventType::Shutdown);
    }

    #[tokio::test]
    async fn test_shutdown_signals_runtime() {
        let (handle, _event_tx, mut shutdown_rx) = test_handle();
        handle.shutdown().await;

        assert!(handle.is_shutdown_requested().await);
        assert!(shutdown_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_health_report_updates_state() {
        let (handle, _event_tx, _shutdown_rx) = test_handle();
        handle.report_health(HealthStatus::Degraded).await;
        assert_eq!(handle.health_status().await, HealthStatus::Degraded);
    }
}
