//! `AgentRuntime`: composition root for the runtime core.

use super::agent_executor::{AgentExecutor, AgentExecutorConfig};
use super::fleet_manager::{FleetConfig, FleetManager};
use super::handoff_coordinator::{HandoffCoordinator, HandoffCoordinatorConfig};
use super::health_monitor::{HealthMonitor, HealthMonitorConfig};
use super::lifecycle_manager::{LifecycleConfig, LifecycleManager};
use super::ports::{CheckpointStore, EventSink, HotStateStore, InferenceClient, SandboxProvider};
use super::resource_manager::{ResourceManager, ResourceManagerConfig};
use super::sandbox_manager::SandboxManager;
use super::warm_pool::WarmPool;
use super::workflow_engine::{WorkflowEngine, WorkflowEngineConfig};
use std::sync::Arc;

/// All the tunables an operator would set in `.abathur/config.yaml` for the
/// runtime core, grouped by owning component.
#[derive(Debug, Clone, Default)]
pub struct AgentRuntimeConfig {
    pub lifecycle: LifecycleConfig,
    pub fleet: FleetConfig,
    pub handoff: HandoffCoordinatorConfig,
    pub health: HealthMonitorConfig,
    pub resource: ResourceManagerConfig,
    pub workflow: WorkflowEngineConfig,
    pub executor: AgentExecutorConfig,
    pub available_runtime_classes: Vec<String>,
}

/// Wires the L02 runtime components together behind one entry point, the
/// way `AgentRuntime` is described.
pub struct AgentRuntime {
    pub lifecycle: Arc<LifecycleManager>,
    pub fleet: Arc<FleetManager>,
    pub warm_pool: Arc<WarmPool>,
    pub resources: Arc<ResourceManager>,
    pub health: Arc<HealthMonitor>,
    pub executor: Arc<AgentExecutor>,
    pub workflows: Arc<WorkflowEngine>,
    pub handoffs: Arc<HandoffCoordinator>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub hot_state: Arc<dyn HotStateStore>,
}

impl AgentRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AgentRuntimeConfig,
        sandbox_provider: Arc<dyn SandboxProvider>,
        event_sink: Arc<dyn EventSink>,
        checkpoints: Arc<dyn CheckpointStore>,
        hot_state: Arc<dyn HotStateStore>,
        inference: Option<Arc<dyn InferenceClient>>,
        warm_pool_template: super::models::AgentConfig,
    ) -> Self {
        let sandbox_manager = SandboxManager::new(config.available_runtime_classes.clone());
        let lifecycle = Arc::new(LifecycleManager::new(config.lifecycle, sandbox_manager, sandbox_provider, event_sink));
        let resources = Arc::new(ResourceManager::new(config.resource, lifecycle.clone()));
        let warm_pool = Arc::new(WarmPool::new(
            super::warm_pool::WarmPoolConfig {
                target_size: 2,
                max_instance_age: std::time::Duration::from_secs(3600),
                replenish_interval: std::time::Duration::from_secs(30),
                template: warm_pool_template,
            },
            lifecycle.clone(),
        ));
        let fleet = Arc::new(FleetManager::new(config.fleet, lifecycle.clone(), Some(warm_pool.clone())));
        let health = Arc::new(HealthMonitor::new(config.health));
        let executor = Arc::new(AgentExecutor::new(config.executor, inference));
        let workflows = Arc::new(WorkflowEngine::new(config.workflow, Some(checkpoints.clone())));
        let handoffs = Arc::new(HandoffCoordinator::new(config.handoff));

        Self { lifecycle, fleet, warm_pool, resources, health, executor, workflows, handoffs, checkpoints, hot_state }
    }

    /// Start background loops (warm pool refresh/replenish). Returns join
    /// handles the caller should retain for the process lifetime.
    pub fn start_background_loops(&self) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        self.warm_pool.start()
    }

    pub fn shutdown(&self) {
        self.warm_pool.stop();
    }
}
