//! Cross-role artifact relay.

use super::errors::{RuntimeError, RuntimeResult};
use super::models::{HandoffArtifact, HandoffStatus};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct HandoffCoordinatorConfig {
    pub max_parallel_roles: usize,
    pub role_timeout: Duration,
    pub max_retries: u32,
    pub checkpoint_on_handoff: bool,
}

impl Default for HandoffCoordinatorConfig {
    fn default() -> Self {
        Self { max_parallel_roles: 4, role_timeout: Duration::from_secs(60), max_retries: 2, checkpoint_on_handoff: false }
    }
}

/// Result of running a single role: free-form output plus an optional
/// early-exit checkpoint signal.
#[derive(Debug, Clone)]
pub struct RoleResult {
    pub output: Value,
    pub stop: bool,
}

/// A registered role executor. Missing registrations fall back to a
/// synthetic simulated result rather than erroring.
#[async_trait]
pub trait RoleExecutor: Send + Sync {
    async fn run(&self, role_id: &str, context: &Value) -> RuntimeResult<RoleResult>;
}

fn extract_artifacts(role_id: &str, target_role: &str, output: &Value) -> Vec<HandoffArtifact> {
    let candidates = ["artifacts", "handoff_artifacts"]
        .iter()
        .find_map(|key| output.get(key))
        .or_else(|| output.get("output").and_then(|o| o.get("artifacts")));

    let Some(Value::Array(items)) = candidates else { return Vec::new() };

    items
        .iter()
        .map(|item| HandoffArtifact {
            id: Uuid::new_v4().to_string(),
            handoff_id: String::new(),
            source_role_id: role_id.to_string(),
            target_role_id: target_role.to_string(),
            artifact_type: item.get("type").and_then(Value::as_str).unwrap_or("unknown").to_string(),
            content: item.get("content").cloned().unwrap_or_else(|| item.clone()),
            status: HandoffStatus::Pending,
            rejection_reason: None,
            created_at: Utc::now(),
            delivered_at: None,
            acknowledged_at: None,
        })
        .collect()
}

pub struct HandoffCoordinator {
    config: HandoffCoordinatorConfig,
    executors: RwLock<HashMap<String, Arc<dyn RoleExecutor>>>,
    handoffs: RwLock<HashMap<String, Vec<HandoffArtifact>>>,
    parallel_semaphore: Arc<Semaphore>,
}

impl HandoffCoordinator {
    pub fn new(config: HandoffCoordinatorConfig) -> Self {
        let permits = config.max_parallel_roles;
        Self {
            config,
            executors: RwLock::new(HashMap::new()),
            handoffs: RwLock::new(HashMap::new()),
            parallel_semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    pub async fn register_role(&self, role_id: &str, executor: Arc<dyn RoleExecutor>) {
        self.executors.write().await.insert(role_id.to_string(), executor);
    }

    async fn run_role_with_retry(&self, role_id: &str, context: &Value) -> RuntimeResult<RoleResult> {
        let executor = self.executors.read().await.get(role_id).cloned();
        let mut attempt = 0;
        loop {
            let outcome = match &executor {
                Some(exec) => {
                    let fut = exec.run(role_id, context);
                    tokio::time::timeout(self.config.role_timeout, fut).await
                }
                None => {
                    // No registered executor: synthetic simulated result.
                    return Ok(RoleResult { output: serde_json::json!({ "role": role_id, "simulated": true }), stop: false });
                }
            };

            match outcome {
                Ok(Ok(result)) => return Ok(result),
                Ok(Err(err)) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(role_id, attempt, %err, "role execution failed, retrying");
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                }
                Ok(Err(err)) => {
                    error!(role_id, %err, "role execution failed permanently");
                    return Err(RuntimeError::RoleExecutionFailed { role: role_id.to_string(), message: err.to_string() });
                }
                Err(_) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(role_id, attempt, "role execution timed out, retrying");
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                }
                Err(_) => {
                    return Err(RuntimeError::RoleExecutionFailed { role: role_id.to_string(), message: "timed out".to_string() });
                }
            }
        }
    }

    /// Sequential chain: execute roles in order, accumulating artifacts.
    pub async fn orchestrate_workflow(&self, task: &Value, role_sequence: &[String], initial_context: Option<Value>) -> RuntimeResult<Vec<HandoffArtifact>> {
        let mut artifacts = Vec::new();
        let mut prior_artifacts: Vec<HandoffArtifact> = Vec::new();

        for (position, role_id) in role_sequence.iter().enumerate() {
            let previous_role = position.checked_sub(1).and_then(|i| role_sequence.get(i));
            let next_role = role_sequence.get(position + 1);

            let context = serde_json::json!({
                "task": task,
                "prior_artifacts": prior_artifacts,
                "position": position,
                "previous_role": previous_role,
                "next_role": next_role,
                "initial_context": initial_context,
            });

            let result = self.run_role_with_retry(role_id, &context).await?;
            let target = next_role.cloned().unwrap_or_default();
            let new_artifacts = extract_artifacts(role_id, &target, &result.output);
            prior_artifacts.extend(new_artifacts.clone());
            artifacts.extend(new_artifacts);

            if self.config.checkpoint_on_handoff {
                info_checkpoint(role_id, position);
            }

            if result.stop {
                break;
            }
        }
        Ok(artifacts)
    }

    /// Parallel specialists: run `parallel_roles` concurrently, then
    /// optionally merge with `merge_role` if all branches succeeded.
    pub async fn orchestrate_parallel(&self, task: &Value, parallel_roles: &[String], merge_role: Option<&str>, initial_context: Option<Value>) -> RuntimeResult<Vec<HandoffArtifact>> {
        let mut handles = Vec::new();
        for role_id in parallel_roles {
            let role_id = role_id.clone();
            let context = serde_json::json!({ "task": task, "role_id": role_id, "initial_context": initial_context });
            let permit_pool = self.parallel_semaphore.clone();
            let result_fut = self.run_role_for_spawn(role_id.clone(), context);
            handles.push(async move {
                let _permit = permit_pool.acquire_owned().await.ok();
                result_fut.await
            });
        }

        let results: Vec<RuntimeResult<RoleResult>> = futures::future::join_all(handles).await;

        let mut artifacts = Vec::new();
        let mut branch_outputs = Vec::new();
        let mut all_succeeded = true;
        for (role_id, result) in parallel_roles.iter().zip(results) {
            match result {
                Ok(role_result) => {
                    let new_artifacts = extract_artifacts(role_id, merge_role.unwrap_or(""), &role_result.output);
                    artifacts.extend(new_artifacts);
                    branch_outputs.push(role_result.output);
                }
                Err(err) => {
                    all_succeeded = false;
                    warn!(role_id, %err, "parallel specialist failed");
                }
            }
        }

        if all_succeeded {
            if let Some(merge_role) = merge_role {
                let merge_context = serde_json::json!({
                    "task": task,
                    "parallel_results": branch_outputs,
                    "artifacts": artifacts,
                });
                let merge_result = self.run_role_with_retry(merge_role, &merge_context).await?;
                artifacts.extend(extract_artifacts(merge_role, "", &merge_result.output));
            }
        }

        Ok(artifacts)
    }

    async fn run_role_for_spawn(&self, role_id: String, context: Value) -> RuntimeResult<RoleResult> {
        self.run_role_with_retry(&role_id, &context).await
    }

    pub async fn create_handoff(&self, mut artifacts: Vec<HandoffArtifact>) -> String {
        let handoff_id = Uuid::new_v4().to_string();
        for artifact in &mut artifacts {
            artifact.handoff_id = handoff_id.clone();
            artifact.status = HandoffStatus::Pending;
            artifact.delivered_at = Some(Utc::now());
        }
        self.handoffs.write().await.insert(handoff_id.clone(), artifacts);
        handoff_id
    }

    pub async fn acknowledge_handoff(&self, handoff_id: &str) -> RuntimeResult<()> {
        let mut handoffs = self.handoffs.write().await;
        let artifacts = handoffs.get_mut(handoff_id).ok_or_else(|| RuntimeError::HandoffNotFound(handoff_id.to_string()))?;
        for artifact in artifacts {
            artifact.status = HandoffStatus::Acknowledged;
            artifact.acknowledged_at = Some(Utc::now());
        }
        Ok(())
    }

    pub async fn reject_handoff(&self, handoff_id: &str, reason: &str) -> RuntimeResult<()> {
        let mut handoffs = self.handoffs.write().await;
        let artifacts = handoffs.get_mut(handoff_id).ok_or_else(|| RuntimeError::HandoffNotFound(handoff_id.to_string()))?;
        for artifact in artifacts {
            artifact.status = HandoffStatus::Rejected;
            artifact.rejection_reason = Some(reason.to_string());
        }
        Ok(())
    }

    pub async fn get_pending_handoffs(&self, target_role: &str) -> Vec<HandoffArtifact> {
        self.handoffs
            .read()
            .await
            .values()
            .flatten()
            .filter(|a| a.target_role_id == target_role && a.status == HandoffStatus::Pending)
            .cloned()
            .collect()
    }
}

fn info_checkpoint(role_id: &str, position: usize) {
    tracing::info!(role_id, position, "checkpointing after handoff");
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoRole;
    #[async_trait]
    impl RoleExecutor for EchoRole {
        async fn run(&self, role_id: &str, _context: &Value) -> RuntimeResult<RoleResult> {
            Ok(RoleResult {
                output: serde_json::json!({ "artifacts": [{ "type": "doc", "content": format!("from {role_id}") }] }),
                stop: false,
            })
        }
    }

    struct StoppingRole;
    #[async_trait]
    impl RoleExecutor for StoppingRole {
        async fn run(&self, _role_id: &str, _context: &Value) -> RuntimeResult<RoleResult> {
            Ok(RoleResult { output: serde_json::json!({}), stop: true })
        }
    }

    #[tokio::test]
    async fn sequential_chain_accumulates_artifacts() {
        let coordinator = HandoffCoordinator::new(HandoffCoordinatorConfig::default());
        coordinator.register_role("writer", Arc::new(EchoRole)).await;
        coordinator.register_role("reviewer", Arc::new(EchoRole)).await;
        let artifacts = coordinator
            .orchestrate_workflow(&serde_json::json!({"task": "t1"}), &["writer".to_string(), "reviewer".to_string()], None)
            .await
            .unwrap();
        assert_eq!(artifacts.len(), 2);
    }

    #[tokio::test]
    async fn missing_executor_falls_back_to_simulation() {
        let coordinator = HandoffCoordinator::new(HandoffCoordinatorConfig::default());
        let artifacts = coordinator.orchestrate_workflow(&serde_json::json!({}), &["ghost".to_string()], None).await.unwrap();
        assert!(artifacts.is_empty());
    }

    #[tokio::test]
    async fn stop_action_exits_chain_early() {
        let coordinator = HandoffCoordinator::new(HandoffCoordinatorConfig::default());
        coordinator.register_role("a", Arc::new(StoppingRole)).await;
        coordinator.register_role("b", Arc::new(EchoRole)).await;
        let artifacts = coordinator
            .orchestrate_workflow(&serde_json::json!({}), &["a".to_string(), "b".to_string()], None)
            .await
            .unwrap();
        assert!(artifacts.is_empty()); // stopped before "b" ran
    }

    #[tokio::test]
    async fn parallel_specialists_merge_after_success() {
        let coordinator = HandoffCoordinator::new(HandoffCoordinatorConfig::default());
        coordinator.register_role("spec1", Arc::new(EchoRole)).await;
        coordinator.register_role("spec2", Arc::new(EchoRole)).await;
        coordinator.register_role("merger", Arc::new(EchoRole)).await;
        let artifacts = coordinator
            .orchestrate_parallel(&serde_json::json!({}), &["spec1".to_string(), "spec2".to_string()], Some("merger"), None)
            .await
            .unwrap();
        assert_eq!(artifacts.len(), 3); // 2 specialists + 1 merge
    }

    #[tokio::test]
    async fn handoff_lifecycle_acknowledge() {
        let coordinator = HandoffCoordinator::new(HandoffCoordinatorConfig::default());
        let artifacts = vec![HandoffArtifact {
            id: "a1".to_string(),
            handoff_id: String::new(),
            source_role_id: "writer".to_string(),
            target_role_id: "reviewer".to_string(),
            artifact_type: "doc".to_string(),
            content: Value::Null,
            status: HandoffStatus::Pending,
            rejection_reason: None,
            created_at: Utc::now(),
            delivered_at: None,
            acknowledged_at: None,
        }];
        let handoff_id = coordinator.create_handoff(artifacts).await;
        let pending = coordinator.get_pending_handoffs("reviewer").await;
        assert_eq!(pending.len(), 1);

        coordinator.acknowledge_handoff(&handoff_id).await.unwrap();
        let pending_after = coordinator.get_pending_handoffs("reviewer").await;
        assert!(pending_after.is_empty());
    }
}
