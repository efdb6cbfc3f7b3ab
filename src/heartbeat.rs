//! Heartbeat state machine for mesh agents.
//!
//! Dual-heartbeat scheme: cheap HEAD probes on the regular interval, full
//! POST registration only when the registry signals topology change or does
//! not know the agent. A registry that stays unreachable moves the machine
//! into standalone mode - the agent keeps serving inbound calls and retries
//! registration with capped exponential backoff until a heartbeat lands.

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::events::HealthStatus;
use crate::registry::ProbeStatus;

/// State of the heartbeat machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatState {
    /// Never (or no longer) known to the registry
    #[default]
    Unregistered,
    /// Registered; probing on the interval
    Registered,
    /// Registry unreachable; serving locally, retrying with backoff
    Standalone,
    /// Shutdown requested
    Draining,
}

/// Next step the runtime loop should take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send full registration/heartbeat (POST)
    Register,
    /// Send fast probe (HEAD)
    Probe,
    /// Sleep before the next action
    Sleep(Duration),
    /// Sleep `backoff`, then register (standalone retry)
    Reconnect { attempt: u32, backoff: Duration },
    /// Nothing left to do
    Stop,
}

/// Tunables for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between probes
    pub interval: Duration,
    /// Base backoff for standalone retries
    pub base_backoff: Duration,
    /// Backoff cap
    pub max_backoff: Duration,
    /// Consecutive probe failures before dropping to standalone
    pub missed_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            missed_threshold: 4,
        }
    }
}

/// Drives registration and heartbeats for one agent.
pub struct HeartbeatStateMachine {
    state: HeartbeatState,
    config: HeartbeatConfig,
    health_status: HealthStatus,
    last_heartbeat: Option<Instant>,
    consecutive_failures: u32,
    retry_attempt: u32,
    heartbeat_count: u64,
}

impl HeartbeatStateMachine {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            state: HeartbeatState::Unregistered,
            config,
            health_status: HealthStatus::Healthy,
            last_heartbeat: None,
            consecutive_failures: 0,
            retry_attempt: 0,
            heartbeat_count: 0,
        }
    }

    pub fn state(&self) -> HeartbeatState {
        self.state
    }

    pub fn health_status(&self) -> HealthStatus {
        self.health_status
    }

    pub fn set_health_status(&mut self, status: HealthStatus) {
        if self.health_status != status {
            info!(
                "Health status changed: {:?} -> {:?}",
                self.health_status, status
            );
            self.health_status = status;
        }
    }

    pub fn heartbeat_count(&self) -> u64 {
        self.heartbeat_count
    }

    pub fn is_registered(&self) -> bool {
        self.state == HeartbeatState::Registered
    }

    /// Agent keeps serving without the registry.
    pub fn is_standalone(&self) -> bool {
        self.state == HeartbeatState::Standalone
    }

    /// Decide the next step for the runtime loop.
    pub fn next_action(&self) -> HeartbeatAction {
        match self.state {
            HeartbeatState::Unregistered => HeartbeatAction::Register,
            HeartbeatState::Registered => {
                if self.interval_elapsed() {
                    HeartbeatAction::Probe
                } else {
                    HeartbeatAction::Sleep(self.time_until_next())
                }
            }
            HeartbeatState::Standalone => HeartbeatAction::Reconnect {
                attempt: self.retry_attempt,
                backoff: self.backoff(),
            },
            HeartbeatState::Draining => HeartbeatAction::Stop,
        }
    }

    /// Process a fast-probe result.
    pub fn on_probe_result(&mut self, status: ProbeStatus) -> HeartbeatAction {
        debug!("Probe result: {:?}", status);

        match status {
            ProbeStatus::NoChanges => {
                self.mark_beat();
                HeartbeatAction::Sleep(self.config.interval)
            }
            ProbeStatus::TopologyChanged => HeartbeatAction::Register,
            ProbeStatus::AgentUnknown => {
                warn!("Agent unknown to registry, re-registering");
                self.state = HeartbeatState::Unregistered;
                HeartbeatAction::Register
            }
            ProbeStatus::RegistryError | ProbeStatus::NetworkError => {
                self.consecutive_failures += 1;
                warn!(
                    "Probe failed ({:?}), consecutive failures: {}",
                    status, self.consecutive_failures
                );
                if self.consecutive_failures >= self.config.missed_threshold {
                    self.enter_standalone();
                }
                HeartbeatAction::Sleep(self.config.interval)
            }
        }
    }

    /// A full heartbeat landed.
    pub fn on_register_success(&mut self) {
        if self.state == HeartbeatState::Standalone {
            info!("Registry reachable again, leaving standalone mode");
        }
        self.mark_beat();
        self.retry_attempt = 0;
        self.state = HeartbeatState::Registered;
    }

    /// A full heartbeat failed.
    ///
    /// Registration failure is not fatal: the agent drops to standalone and
    /// expects a later heartbeat to succeed.
    pub fn on_register_failure(&mut self, error: &str) {
        warn!("Registration failed: {}", error);
        self.consecutive_failures += 1;
        self.retry_attempt += 1;
        self.enter_standalone();
    }

    pub fn shutdown(&mut self) {
        info!("Heartbeat shutdown requested");
        self.state = HeartbeatState::Draining;
    }

    pub fn is_draining(&self) -> bool {
        self.state == HeartbeatState::Draining
    }

    fn enter_standalone(&mut self) {
        if self.state != HeartbeatState::Standalone {
            warn!("Entering standalone mode (registry unreachable)");
            self.state = HeartbeatState::Standalone;
        }
    }

    fn mark_beat(&mut self) {
        self.last_heartbeat = Some(Instant::now());
        self.consecutive_failures = 0;
        self.heartbeat_count += 1;
    }

    fn interval_elapsed(&self) -> bool {
        match self.last_heartbeat {
            Some(last) => last.elapsed() >= self.config.interval,
            None => true,
        }
    }

    fn time_until_next(&self) -> Duration {
        match self.last_heartbeat {
            Some(last) => self.config.interval.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }

    fn backoff(&self) -> Duration {
        let base = self.config.base_backoff.as_millis() as u64;
        let factor = 2u64.saturating_pow(self.retry_attempt);
        let backoff_ms = base.saturating_mul(factor);
        let max_ms = self.config.max_backoff.as_millis() as u64;
        Duration::from_millis(backoff_ms.min(max_ms))
    }
}
