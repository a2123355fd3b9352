//! Agent Runtime Core (Layer L02).
//!
//! Sandbox policy derivation, lifecycle state machine, checkpoint/restore,
//! resource quota enforcement, graceful drain with a warm-instance pool,
//! workflow graph execution, and multi-role artifact handoff. Wired
//! together behind the [`AgentRuntime`] facade.

pub mod agent_executor;
pub mod checkpoint_store;
pub mod errors;
pub mod facade;
pub mod fleet_manager;
pub mod handoff_coordinator;
pub mod health_monitor;
pub mod hot_state_store;
pub mod lifecycle_manager;
pub mod local_sandbox;
pub mod models;
pub mod ports;
pub mod resource_manager;
pub mod sandbox_manager;
pub mod warm_pool;
pub mod workflow_engine;

pub use agent_executor::{AgentExecutor, AgentExecutorConfig, ExecutionContext, ToolInvocation, ToolResult};
pub use checkpoint_store::{CheckpointStoreConfig, InMemoryCheckpointStore, SqliteCheckpointStore};
pub use errors::{ErrorKind, RuntimeError, RuntimeResult};
pub use facade::{AgentRuntime, AgentRuntimeConfig};
pub use fleet_manager::{DrainState, FleetConfig, FleetManager, ScalingAction};
pub use handoff_coordinator::{HandoffCoordinator, HandoffCoordinatorConfig};
pub use health_monitor::{HealthMonitor, HealthMonitorConfig};
pub use hot_state_store::{InMemoryHotStateStore, RedisHotStateStore};
pub use lifecycle_manager::{LifecycleConfig, LifecycleManager};
pub use local_sandbox::LocalSandboxProvider;
pub use models::{
    AgentConfig, AgentInstance, AgentState, Checkpoint, ContainerState, EnforcementAction,
    EnforcementMode, HandoffArtifact, NetworkPolicy, ResourceLimits, ResourceQuota,
    SandboxConfiguration, SpawnResult, TrustLevel, WorkflowExecution, WorkflowGraph,
};
pub use ports::{
    CheckpointStore, EventSink, HotStateStore, InferenceClient, QuotaEnforcementSink,
    SandboxProvider, ToolClient,
};
pub use resource_manager::{ResourceManager, ResourceManagerConfig};
pub use sandbox_manager::SandboxManager;
pub use warm_pool::{WarmPool, WarmPoolConfig};
pub use workflow_engine::{WorkflowEngine, WorkflowEngineConfig};
