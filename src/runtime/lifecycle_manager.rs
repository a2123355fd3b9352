//! Agent lifecycle state machine.

use super::errors::{RuntimeError, RuntimeResult};
use super::models::{
    AgentConfig, AgentInstance, AgentState, EnforcementAction, SandboxConfiguration, SpawnResult,
};
use super::ports::{EventSink, QuotaEnforcementSink, SandboxProvider};
use super::sandbox_manager::SandboxManager;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub spawn_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub max_restart_count: u32,
    pub enable_suspend: bool,
    pub default_image: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            spawn_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(15),
            max_restart_count: 3,
            enable_suspend: true,
            default_image: "agent-runtime:latest".to_string(),
        }
    }
}

struct Slot {
    instance: AgentInstance,
    lock: Arc<Mutex<()>>,
}

/// Owns all `AgentInstance` mutation. Every agent_id is serialized behind
/// its own `tokio::sync::Mutex` so concurrent operations on one agent are
/// linearizable without blocking unrelated agents.
pub struct LifecycleManager {
    config: LifecycleConfig,
    sandbox_manager: SandboxManager,
    provider: Arc<dyn SandboxProvider>,
    event_sink: Arc<dyn EventSink>,
    instances: tokio::sync::RwLock<HashMap<String, Slot>>,
}

impl LifecycleManager {
    pub fn new(
        config: LifecycleConfig,
        sandbox_manager: SandboxManager,
        provider: Arc<dyn SandboxProvider>,
        event_sink: Arc<dyn EventSink>,
    ) -> Self {
        Self { config, sandbox_manager, provider, event_sink, instances: tokio::sync::RwLock::new(HashMap::new()) }
    }

    async fn lock_for(&self, agent_id: &str) -> Arc<Mutex<()>> {
        let instances = self.instances.read().await;
        if let Some(slot) = instances.get(agent_id) {
            return slot.lock.clone();
        }
        Arc::new(Mutex::new(()))
    }

    /// Runs the full spawn pipeline: validate limits, derive sandbox policy,
    /// provision the container, and record the instance as `Running`.
    pub async fn spawn(&self, mut config: AgentConfig, initial_context: Option<String>) -> RuntimeResult<SpawnResult> {
        config.resource_limits.validate().map_err(RuntimeError::QuotaInvalid)?;

        let sandbox: SandboxConfiguration = self.sandbox_manager.derive(
            config.trust_level,
            config.requested_runtime_class.as_deref(),
            config.resource_limits,
        );
        if sandbox.security_context.privilege_escalation {
            return Err(RuntimeError::PrivilegeEscalationRequired);
        }
        if sandbox.security_context.dropped_capabilities.is_empty() {
            warn!(agent_id = %config.agent_id, "sandbox does not drop all capabilities");
        }

        let mut env = config.environment.clone();
        if let Some(ref ctx) = initial_context.clone().or_else(|| config.initial_context.clone()) {
            env.insert("INITIAL_CONTEXT".to_string(), ctx.clone());
        }
        env.insert("AGENT_ID".to_string(), config.agent_id.clone());

        let spawn_fut = self.provider.spawn(&config, &sandbox, &env);
        let container_handle = tokio::time::timeout(self.config.spawn_timeout, spawn_fut)
            .await
            .map_err(|_| RuntimeError::SpawnTimeout(self.config.spawn_timeout))??;

        let now = Utc::now();
        let session_id = Uuid::new_v4().to_string();
        let instance = AgentInstance {
            agent_id: config.agent_id.clone(),
            session_id: session_id.clone(),
            state: AgentState::Running,
            config,
            sandbox: sandbox.clone(),
            resource_usage: super::models::ResourceUsage::default(),
            container_handle: Some(container_handle.clone()),
            container_state: Some(super::models::ContainerState::Running),
            restart_count: 0,
            created_at: now,
            updated_at: now,
            terminated_at: None,
        };

        let agent_id = instance.agent_id.clone();
        self.instances
            .write()
            .await
            .insert(agent_id.clone(), Slot { instance: instance.clone(), lock: Arc::new(Mutex::new(())) });

        self.event_sink
            .emit("agent.spawned", &agent_id, json!({ "state": "running", "session_id": session_id }))
            .await;

        Ok(SpawnResult {
            agent_id: instance.agent_id,
            session_id: instance.session_id,
            state: instance.state,
            sandbox_type: sandbox.runtime_class,
            container_id: Some(container_handle),
            pod_name: None,
            created_at: now,
        })
    }

    async fn transition(&self, agent_id: &str, to: AgentState) -> RuntimeResult<()> {
        let mut instances = self.instances.write().await;
        let slot = instances
            .get_mut(agent_id)
            .ok_or_else(|| RuntimeError::AgentNotFound(agent_id.to_string()))?;
        let from = slot.instance.state;
        if from == to {
            return Ok(()); // idempotent no-op, e.g. double terminate
        }
        if !from.can_transition_to(to) {
            return Err(RuntimeError::InvalidStateTransition {
                agent_id: agent_id.to_string(),
                from: format!("{from:?}"),
                to: format!("{to:?}"),
            });
        }
        slot.instance.state = to;
        slot.instance.updated_at = Utc::now();
        if to.is_terminal() {
            slot.instance.terminated_at = Some(Utc::now());
        }
        Ok(())
    }

    pub async fn terminate(&self, agent_id: &str, reason: &str, force: bool) -> RuntimeResult<()> {
        let guard_lock = self.lock_for(agent_id).await;
        let _guard = guard_lock.lock().await;

        let already_terminal = {
            let instances = self.instances.read().await;
            instances.get(agent_id).map(|s| s.instance.state.is_terminal())
        };
        match already_terminal {
            None => return Err(RuntimeError::AgentNotFound(agent_id.to_string())),
            Some(true) => return Ok(()), // idempotent
            Some(false) => {}
        }

        let handle = {
            let instances = self.instances.read().await;
            instances.get(agent_id).and_then(|s| s.instance.container_handle.clone())
        };

        let stop_result = if let Some(handle) = handle {
            if force {
                self.provider.kill(&handle).await
            } else {
                self.provider.stop(&handle, self.config.shutdown_timeout).await
            }
        } else {
            Ok(())
        };

        match stop_result {
            Ok(()) => {
                self.transition(agent_id, AgentState::Terminated).await?;
                self.event_sink
                    .emit("agent.terminated", agent_id, json!({ "reason": reason, "force": force }))
                    .await;
                Ok(())
            }
            Err(err) => {
                error!(agent_id, %err, "termination failed");
                let _ = self.transition(agent_id, AgentState::Failed).await;
                Err(RuntimeError::TerminationFailed(err.to_string()))
            }
        }
    }

    pub async fn suspend(&self, agent_id: &str, checkpoint: bool) -> RuntimeResult<String> {
        if !self.config.enable_suspend {
            return Err(RuntimeError::InvalidStateTransition {
                agent_id: agent_id.to_string(),
                from: "Running".to_string(),
                to: "Suspended (disabled)".to_string(),
            });
        }
        let handle = {
            let instances = self.instances.read().await;
            instances
                .get(agent_id)
                .ok_or_else(|| RuntimeError::AgentNotFound(agent_id.to_string()))?
                .instance
                .container_handle
                .clone()
        };

        let checkpoint_id = if checkpoint {
            match handle {
                Some(h) => self.provider.checkpoint(&h).await?,
                None => String::new(),
            }
        } else {
            String::new()
        };

        self.transition(agent_id, AgentState::Suspended).await?;
        self.event_sink
            .emit("agent.suspended", agent_id, json!({ "checkpoint_id": checkpoint_id }))
            .await;
        Ok(checkpoint_id)
    }

    pub async fn resume(&self, agent_id: &str, checkpoint_id: Option<&str>) -> RuntimeResult<AgentState> {
        if let Some(cp) = checkpoint_id {
            let handle = {
                let instances = self.instances.read().await;
                instances.get(agent_id).and_then(|s| s.instance.container_handle.clone())
            };
            if let Some(h) = handle {
                self.provider.restore(&h, cp).await?;
            }
        }
        self.transition(agent_id, AgentState::Running).await?;
        self.event_sink.emit("agent.resumed", agent_id, json!({ "restored_from_checkpoint": checkpoint_id })).await;
        Ok(AgentState::Running)
    }

    pub async fn restart(&self, agent_id: &str, reason: &str) -> RuntimeResult<SpawnResult> {
        let (original_config, restart_count) = {
            let mut instances = self.instances.write().await;
            let slot = instances
                .get_mut(agent_id)
                .ok_or_else(|| RuntimeError::AgentNotFound(agent_id.to_string()))?;
            if slot.instance.restart_count >= self.config.max_restart_count {
                return Err(RuntimeError::TerminationFailed(format!(
                    "max_restart_count ({}) exceeded for {agent_id}",
                    self.config.max_restart_count
                )));
            }
            slot.instance.restart_count += 1;
            (slot.instance.config.clone(), slot.instance.restart_count)
        };

        self.terminate(agent_id, reason, true).await?;
        let result = self.spawn(original_config, None).await?;

        // `spawn` always writes a fresh `Slot` with `restart_count: 0`; carry
        // the accumulated count through the re-spawn so `max_restart_count`
        // keeps being enforced across respawns.
        if let Some(slot) = self.instances.write().await.get_mut(agent_id) {
            slot.instance.restart_count = restart_count;
        }

        Ok(result)
    }

    pub async fn get_state(&self, agent_id: &str) -> RuntimeResult<AgentState> {
        self.instances
            .read()
            .await
            .get(agent_id)
            .map(|s| s.instance.state)
            .ok_or_else(|| RuntimeError::AgentNotFound(agent_id.to_string()))
    }

    pub async fn get_instance(&self, agent_id: &str) -> RuntimeResult<AgentInstance> {
        self.instances
            .read()
            .await
            .get(agent_id)
            .map(|s| s.instance.clone())
            .ok_or_else(|| RuntimeError::AgentNotFound(agent_id.to_string()))
    }

    pub async fn list_instances(&self) -> Vec<AgentInstance> {
        self.instances.read().await.values().map(|s| s.instance.clone()).collect()
    }

    pub async fn cleanup(&self) {
        let _ = tokio::time::timeout(Duration::from_secs(2), async {
            info!("lifecycle manager cleanup complete");
        })
        .await;
    }
}

/// `LifecycleManager` is the `QuotaEnforcementSink` `ResourceManager` calls
/// into.
#[async_trait]
impl QuotaEnforcementSink for LifecycleManager {
    async fn enforce(&self, agent_id: &str, action: EnforcementAction, reason: &str) {
        match action {
            EnforcementAction::Warn | EnforcementAction::Throttle => {
                warn!(agent_id, reason, "quota enforcement: {action:?} (no state change)");
            }
            EnforcementAction::Suspend => {
                if let Err(err) = self.suspend(agent_id, false).await {
                    error!(agent_id, %err, "failed to suspend agent on quota breach");
                }
            }
            EnforcementAction::Terminate => {
                if let Err(err) = self.terminate(agent_id, reason, true).await {
                    error!(agent_id, %err, "failed to terminate agent on quota breach");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::models::{ContainerState, ResourceLimits, TrustLevel};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProvider {
        spawn_calls: AtomicUsize,
    }

    #[async_trait]
    impl SandboxProvider for FakeProvider {
        async fn spawn(
            &self,
            _config: &AgentConfig,
            _sandbox: &SandboxConfiguration,
            _env: &HashMap<String, String>,
        ) -> RuntimeResult<String> {
            self.spawn_calls.fetch_add(1, Ordering::SeqCst);
            Ok("container-1".to_string())
        }
        async fn stop(&self, _handle: &str, _timeout: Duration) -> RuntimeResult<()> {
            Ok(())
        }
        async fn kill(&self, _handle: &str) -> RuntimeResult<()> {
            Ok(())
        }
        async fn checkpoint(&self, _handle: &str) -> RuntimeResult<String> {
            Ok("cp-1".to_string())
        }
        async fn restore(&self, _handle: &str, _checkpoint_id: &str) -> RuntimeResult<()> {
            Ok(())
        }
        async fn state(&self, _handle: &str) -> RuntimeResult<ContainerState> {
            Ok(ContainerState::Running)
        }
    }

    struct NullSink;
    #[async_trait]
    impl EventSink for NullSink {
        async fn emit(&self, _event_type: &str, _aggregate_id: &str, _payload: serde_json::Value) {}
    }

    fn config(agent_id: &str) -> AgentConfig {
        AgentConfig {
            agent_id: agent_id.to_string(),
            trust_level: TrustLevel::Standard,
            resource_limits: ResourceLimits { cpu_cores: 1.0, memory_mb: 512, tokens_per_hour: 10_000 },
            tools: vec![],
            environment: HashMap::new(),
            initial_context: None,
            requested_runtime_class: None,
            image: "img".to_string(),
            command: vec![],
        }
    }

    fn manager() -> LifecycleManager {
        LifecycleManager::new(
            LifecycleConfig::default(),
            SandboxManager::new(vec!["runc".into(), "gvisor".into(), "kata".into(), "kata-cc".into()]),
            Arc::new(FakeProvider { spawn_calls: AtomicUsize::new(0) }),
            Arc::new(NullSink),
        )
    }

    #[tokio::test]
    async fn spawn_then_execute_then_terminate() {
        let mgr = manager();
        let result = mgr.spawn(config("a1"), None).await.unwrap();
        assert_eq!(result.state, AgentState::Running);
        assert_eq!(mgr.get_state("a1").await.unwrap(), AgentState::Running);

        mgr.terminate("a1", "done", false).await.unwrap();
        assert_eq!(mgr.get_state("a1").await.unwrap(), AgentState::Terminated);
    }

    #[tokio::test]
    async fn double_terminate_is_idempotent() {
        let mgr = manager();
        mgr.spawn(config("a1"), None).await.unwrap();
        mgr.terminate("a1", "done", false).await.unwrap();
        mgr.terminate("a1", "done", false).await.unwrap();
        assert_eq!(mgr.get_state("a1").await.unwrap(), AgentState::Terminated);
    }

    #[tokio::test]
    async fn suspend_then_resume_restores_running() {
        let mgr = manager();
        mgr.spawn(config("a1"), None).await.unwrap();
        let cp = mgr.suspend("a1", true).await.unwrap();
        assert_eq!(cp, "cp-1");
        assert_eq!(mgr.get_state("a1").await.unwrap(), AgentState::Suspended);

        mgr.resume("a1", Some(&cp)).await.unwrap();
        assert_eq!(mgr.get_state("a1").await.unwrap(), AgentState::Running);
    }

    #[tokio::test]
    async fn invalid_transition_rejected() {
        let mgr = manager();
        mgr.spawn(config("a1"), None).await.unwrap();
        mgr.terminate("a1", "done", false).await.unwrap();
        let err = mgr.resume("a1", None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn restart_respects_max_count() {
        let mut cfg = LifecycleConfig::default();
        cfg.max_restart_count = 1;
        let mgr = LifecycleManager::new(
            cfg,
            SandboxManager::new(vec!["gvisor".into()]),
            Arc::new(FakeProvider { spawn_calls: AtomicUsize::new(0) }),
            Arc::new(NullSink),
        );
        mgr.spawn(config("a1"), None).await.unwrap();
        mgr.restart("a1", "crash").await.unwrap();
        let err = mgr.restart("a1", "crash again").await.unwrap_err();
        assert!(matches!(err, RuntimeError::TerminationFailed(_)));
    }

    #[tokio::test]
    async fn unknown_agent_not_found() {
        let mgr = manager();
        let err = mgr.get_state("ghost").await.unwrap_err();
        assert!(matches!(err, RuntimeError::AgentNotFound(_)));
    }
}
