//! Liveness/readiness probing.

use super::models::AgentState;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub liveness_interval: Duration,
    pub liveness_timeout: Duration,
    pub liveness_failure_threshold: u32,
    pub readiness_interval: Duration,
    pub readiness_timeout: Duration,
    pub readiness_failure_threshold: u32,
    pub stuck_agent_timeout: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            liveness_interval: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(5),
            liveness_failure_threshold: 3,
            readiness_interval: Duration::from_secs(10),
            readiness_timeout: Duration::from_secs(5),
            readiness_failure_threshold: 3,
            stuck_agent_timeout: Duration::from_secs(120),
        }
    }
}

/// Per-agent health bookkeeping.
#[derive(Debug, Clone)]
pub struct AgentHealth {
    pub is_healthy: bool,
    pub is_ready: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub consecutive_liveness_failures: u32,
    pub consecutive_readiness_failures: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_latency_ms: f64,
}

impl AgentHealth {
    fn new() -> Self {
        Self {
            is_healthy: true,
            is_ready: true,
            last_heartbeat: Utc::now(),
            consecutive_liveness_failures: 0,
            consecutive_readiness_failures: 0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            avg_latency_ms: 0.0,
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        }
    }
}

pub struct HealthMonitor {
    config: HealthMonitorConfig,
    agents: Arc<RwLock<HashMap<String, AgentHealth>>>,
    cancel: CancellationToken,
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig) -> Self {
        Self { config, agents: Arc::new(RwLock::new(HashMap::new())), cancel: CancellationToken::new() }
    }

    pub async fn register(&self, agent_id: &str) {
        self.agents.write().await.insert(agent_id.to_string(), AgentHealth::new());
    }

    pub async fn unregister(&self, agent_id: &str) {
        self.agents.write().await.remove(agent_id);
    }

    /// Record a completed request against an agent, updating the EMA
    /// latency (alpha = 0.2) and refreshing the heartbeat.
    pub async fn record_request(&self, agent_id: &str, success: bool, latency_ms: f64) {
        let mut agents = self.agents.write().await;
        if let Some(health) = agents.get_mut(agent_id) {
            health.total_requests += 1;
            if success {
                health.successful_requests += 1;
            } else {
                health.failed_requests += 1;
            }
            const ALPHA: f64 = 0.2;
            health.avg_latency_ms = if health.total_requests == 1 {
                latency_ms
            } else {
                ALPHA * latency_ms + (1.0 - ALPHA) * health.avg_latency_ms
            };
            health.last_heartbeat = Utc::now();
        }
    }

    /// Evaluate liveness for one agent: fails if unregistered or stuck.
    pub async fn check_liveness(&self, agent_id: &str) -> bool {
        let mut agents = self.agents.write().await;
        let Some(health) = agents.get_mut(agent_id) else {
            return false;
        };
        let stuck = Utc::now().signed_duration_since(health.last_heartbeat)
            > chrono::Duration::from_std(self.config.stuck_agent_timeout).unwrap_or_default();
        if stuck {
            health.consecutive_liveness_failures += 1;
        } else {
            health.consecutive_liveness_failures = 0;
        }
        health.is_healthy = health.consecutive_liveness_failures < self.config.liveness_failure_threshold;
        if !health.is_healthy {
            warn!(agent_id, "liveness check failed: agent considered unhealthy");
        }
        health.is_healthy
    }

    /// Evaluate readiness: fails if agent state != Running or error_rate > 0.5.
    pub async fn check_readiness(&self, agent_id: &str, agent_state: AgentState) -> bool {
        let mut agents = self.agents.write().await;
        let Some(health) = agents.get_mut(agent_id) else {
            return false;
        };
        let failing = agent_state != AgentState::Running || health.error_rate() > 0.5;
        if failing {
            health.consecutive_readiness_failures += 1;
        } else {
            health.consecutive_readiness_failures = 0;
        }
        health.is_ready = health.consecutive_readiness_failures < self.config.readiness_failure_threshold;
        health.is_ready
    }

    pub async fn snapshot(&self, agent_id: &str) -> Option<AgentHealth> {
        self.agents.read().await.get(agent_id).cloned()
    }

    /// Best-effort teardown, bounded by the 2-second soft budget.
    pub async fn cleanup(&self) {
        self.cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), async {
            self.agents.write().await.clear();
        })
        .await;
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
