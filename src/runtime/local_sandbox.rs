//! `LocalSandboxProvider`: a `SandboxProvider` backed by a tracked
//! in-process tokio task, standing in for a container runtime. No
//! Kubernetes/Docker backend ships in this crate; this is the only
//! concrete implementation.

use super::errors::{RuntimeError, RuntimeResult};
use super::models::{AgentConfig, ContainerState, SandboxConfiguration};
use super::ports::SandboxProvider;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

struct LocalContainer {
    state: ContainerState,
    handle: Option<JoinHandle<()>>,
    checkpoints: Vec<String>,
}

/// Spawns a no-op background task per agent and tracks its lifecycle state
/// locally. `checkpoint`/`restore` record and replay nothing beyond the
/// container's own running/stopped status — real state capture is the
/// runtime core's `CheckpointStore`, not this provider.
#[derive(Default)]
pub struct LocalSandboxProvider {
    containers: Mutex<HashMap<String, LocalContainer>>,
}

impl LocalSandboxProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    async fn spawn(
        &self,
        config: &AgentConfig,
        _sandbox: &SandboxConfiguration,
        _env: &HashMap<String, String>,
    ) -> RuntimeResult<String> {
        let handle_id = format!("local-{}-{}", config.agent_id, Uuid::new_v4());
        let task = tokio::spawn(async move {
            std::future::pending::<()>().await;
        });

        let mut containers = self.containers.lock().await;
        containers.insert(
            handle_id.clone(),
            LocalContainer { state: ContainerState::Running, handle: Some(task), checkpoints: Vec::new() },
        );
        Ok(handle_id)
    }

    async fn stop(&self, container_handle: &str, graceful_timeout: std::time::Duration) -> RuntimeResult<()> {
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(container_handle)
            .ok_or_else(|| RuntimeError::SandboxError(format!("unknown container {container_handle}")))?;

        if let Some(task) = container.handle.take() {
            task.abort();
            let _ = tokio::time::timeout(graceful_timeout, task).await;
        }
        container.state = ContainerState::Stopped;
        Ok(())
    }

    async fn kill(&self, container_handle: &str) -> RuntimeResult<()> {
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(container_handle)
            .ok_or_else(|| RuntimeError::SandboxError(format!("unknown container {container_handle}")))?;

        if let Some(task) = container.handle.take() {
            task.abort();
        }
        container.state = ContainerState::Stopped;
        Ok(())
    }

    async fn checkpoint(&self, container_handle: &str) -> RuntimeResult<String> {
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(container_handle)
            .ok_or_else(|| RuntimeError::SandboxError(format!("unknown container {container_handle}")))?;

        let checkpoint_id = format!("local-ckpt-{}", Uuid::new_v4());
        container.checkpoints.push(checkpoint_id.clone());
        Ok(checkpoint_id)
    }

    async fn restore(&self, container_handle: &str, checkpoint_id: &str) -> RuntimeResult<()> {
        let containers = self.containers.lock().await;
        let container = containers
            .get(container_handle)
            .ok_or_else(|| RuntimeError::SandboxError(format!("unknown container {container_handle}")))?;

        if !container.checkpoints.iter().any(|c| c == checkpoint_id) {
            return Err(RuntimeError::SandboxError(format!(
                "checkpoint {checkpoint_id} not found for container {container_handle}"
            )));
        }
        Ok(())
    }

    async fn state(&self, container_handle: &str) -> RuntimeResult<ContainerState> {
        let containers = self.containers.lock().await;
        Ok(containers.get(container_handle).map(|c| c.state).unwrap_or(ContainerState::Unknown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::models::{NetworkPolicy, ResourceLimits, SecurityContext, TrustLevel};

    fn test_limits() -> ResourceLimits {
        ResourceLimits { cpu_cores: 1.0, memory_mb: 512, tokens_per_hour: 10_000 }
    }

    fn test_config() -> AgentConfig {
        AgentConfig {
            agent_id: "agent-1".to_string(),
            trust_level: TrustLevel::Standard,
            resource_limits: test_limits(),
            tools: vec![],
            environment: HashMap::new(),
            initial_context: None,
            requested_runtime_class: None,
            image: "abathur/agent:latest".to_string(),
            command: vec![],
        }
    }

    fn test_sandbox() -> SandboxConfiguration {
        SandboxConfiguration {
            runtime_class: "gvisor".to_string(),
            trust_level: TrustLevel::Standard,
            security_context: SecurityContext::standard_non_root(),
            network_policy: NetworkPolicy::Restricted,
            resource_limits: test_limits(),
        }
    }

    #[tokio::test]
    async fn spawn_then_state_is_running() {
        let provider = LocalSandboxProvider::new();
        let handle = provider.spawn(&test_config(), &test_sandbox(), &HashMap::new()).await.unwrap();
        assert_eq!(provider.state(&handle).await.unwrap(), ContainerState::Running);
    }

    #[tokio::test]
    async fn stop_marks_stopped() {
        let provider = LocalSandboxProvider::new();
        let handle = provider.spawn(&test_config(), &test_sandbox(), &HashMap::new()).await.unwrap();
        provider.stop(&handle, std::time::Duration::from_millis(50)).await.unwrap();
        assert_eq!(provider.state(&handle).await.unwrap(), ContainerState::Stopped);
    }

    #[tokio::test]
    async fn checkpoint_then_restore_round_trips() {
        let provider = LocalSandboxProvider::new();
        let handle = provider.spawn(&test_config(), &test_sandbox(), &HashMap::new()).await.unwrap();
        let checkpoint_id = provider.checkpoint(&handle).await.unwrap();
        provider.restore(&handle, &checkpoint_id).await.unwrap();
    }

    #[tokio::test]
    async fn restore_unknown_checkpoint_fails() {
        let provider = LocalSandboxProvider::new();
        let handle = provider.spawn(&test_config(), &test_sandbox(), &HashMap::new()).await.unwrap();
        assert!(provider.restore(&handle, "bogus").await.is_err());
    }

    #[tokio::test]
    async fn unknown_container_state_is_unknown() {
        let provider = LocalSandboxProvider::new();
        assert_eq!(provider.state("missing").await.unwrap(), ContainerState::Unknown);
    }
}
