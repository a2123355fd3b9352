//! Data model for the agent runtime core (L02).
//!
//! Tagged variants rather than ambient dict-of-anything payloads, so state
//! transitions and resource checks stay exhaustive at the type level.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Trust level assigned to an agent at spawn time, driving sandbox strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Trusted,
    Standard,
    Untrusted,
    Confidential,
}

/// Lifecycle state of an `AgentInstance`. Transitions form a DAG;
/// `Terminated`/`Failed` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Pending,
    Running,
    Suspended,
    Terminated,
    Failed,
}

impl AgentState {
    /// Whether `self -> to` is a legal transition.
    pub const fn can_transition_to(self, to: Self) -> bool {
        use AgentState::{Failed, Pending, Running, Suspended, Terminated};
        matches!(
            (self, to),
            (Pending, Running)
                | (Running, Suspended)
                | (Running, Terminated)
                | (Suspended, Running)
                | (Suspended, Terminated)
                | (Pending, Failed)
                | (Running, Failed)
                | (Suspended, Failed)
        )
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

/// Network egress policy of a sandbox, derived from trust level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    Isolated,
    Restricted,
    AllowEgress,
}

/// Container/sandbox runtime backend identifier (e.g. `"runc"`, `"gvisor"`).
pub type RuntimeClass = String;

/// Parsed resource limits for an agent or quota scope.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU cores (fractional, parsed from `"500m"`/`"2"` strings).
    pub cpu_cores: f64,
    /// Memory ceiling in MiB.
    pub memory_mb: u64,
    /// Token budget per hour.
    pub tokens_per_hour: u64,
}

impl ResourceLimits {
    /// Validate bounds: CPU in (0, 32], memory in (0, 64 GiB], tokens >= 0.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.cpu_cores > 0.0 && self.cpu_cores <= 32.0) {
            return Err(format!("cpu must be in (0, 32] cores, got {}", self.cpu_cores));
        }
        if self.memory_mb == 0 || self.memory_mb > 64 * 1024 {
            return Err(format!("memory must be in (0, 64 GiB], got {} MiB", self.memory_mb));
        }
        Ok(())
    }
}

/// Security context portion of a `SandboxConfiguration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub run_as_non_root: bool,
    pub read_only_root: bool,
    pub dropped_capabilities: Vec<String>,
    pub seccomp_profile: String,
    pub privilege_escalation: bool,
}

impl SecurityContext {
    pub fn standard_non_root() -> Self {
        Self {
            run_as_non_root: true,
            read_only_root: false,
            dropped_capabilities: vec!["ALL".to_string()],
            seccomp_profile: "runtime/default".to_string(),
            privilege_escalation: false,
        }
    }
}

/// Fully derived sandbox policy for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfiguration {
    pub runtime_class: RuntimeClass,
    pub trust_level: TrustLevel,
    pub security_context: SecurityContext,
    pub network_policy: NetworkPolicy,
    pub resource_limits: ResourceLimits,
}

/// Immutable spawn-time configuration for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    pub trust_level: TrustLevel,
    pub resource_limits: ResourceLimits,
    pub tools: Vec<String>,
    pub environment: HashMap<String, String>,
    pub initial_context: Option<String>,
    pub requested_runtime_class: Option<RuntimeClass>,
    pub image: String,
    pub command: Vec<String>,
}

/// Resident container/sandbox state as reported by `SandboxProvider`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Creating,
    Running,
    Paused,
    Stopped,
    Unknown,
}

/// A running (or terminated) agent. `LifecycleManager` owns all mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInstance {
    pub agent_id: String,
    pub session_id: String,
    pub state: AgentState,
    pub config: AgentConfig,
    pub sandbox: SandboxConfiguration,
    pub resource_usage: ResourceUsage,
    pub container_handle: Option<String>,
    pub container_state: Option<ContainerState>,
    pub restart_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
}

/// Live usage counters for a `ResourceQuota`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_seconds: f64,
    pub memory_peak_mb: u64,
    pub tokens_consumed: u64,
}

/// Scope that a `ResourceQuota` applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "target_id")]
pub enum QuotaScope {
    Agent(String),
    Tenant(String),
    Namespace(String),
}

/// Per-resource enforcement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    WarnOnly,
    SoftThenHard,
    Hard,
}

/// Action ResourceManager signals to the `QuotaEnforcementSink`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementAction {
    Warn,
    Throttle,
    Suspend,
    Terminate,
}

/// A quota tracked by `ResourceManager`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub scope: QuotaScope,
    pub limits: ResourceLimits,
    pub usage: ResourceUsage,
    pub reset_at: DateTime<Utc>,
    pub cpu_enforcement: EnforcementMode,
    pub memory_enforcement: EnforcementMode,
    pub token_enforcement: EnforcementMode,
    pub warned_cpu: bool,
    pub warned_memory: bool,
    pub warned_tokens: bool,
}

/// An immutable persisted checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub agent_id: String,
    pub session_id: String,
    pub state: AgentState,
    pub context: Vec<u8>,
    pub compressed: bool,
    pub metadata: Value,
    pub size_bytes: usize,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Node type in a `WorkflowGraph`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum NodeType {
    Agent { role: String },
    Conditional,
    Parallel { children: Vec<String> },
    End,
}

/// A node definition within a `WorkflowGraph`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub node_id: String,
    pub node_type: NodeType,
    pub config: Value,
}

/// A directed, optionally-conditioned edge between workflow nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub source: String,
    pub target: String,
    /// Empty string is the default/fallback edge.
    pub condition: String,
}

/// A workflow definition: nodes + edges + entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub graph_id: String,
    pub nodes: HashMap<String, WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
    pub entry_node: String,
}

impl WorkflowGraph {
    /// Validate that the entry node and every edge endpoint exist.
    pub fn validate(&self) -> Result<(), String> {
        if !self.nodes.contains_key(&self.entry_node) {
            return Err(format!("entry node {} not in graph", self.entry_node));
        }
        for edge in &self.edges {
            if !self.nodes.contains_key(&edge.source) {
                return Err(format!("edge source {} not in graph", edge.source));
            }
            if !self.nodes.contains_key(&edge.target) {
                return Err(format!("edge target {} not in graph", edge.target));
            }
        }
        Ok(())
    }

    /// Outgoing edges from a node, in declaration order.
    pub fn outgoing(&self, node_id: &str) -> Vec<&WorkflowEdge> {
        self.edges.iter().filter(|e| e.source == node_id).collect()
    }
}

/// Status of a `WorkflowExecution`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Suspended,
}

/// Execution state of a single in-flight (or checkpointed) workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: String,
    pub graph: WorkflowGraph,
    pub status: WorkflowStatus,
    pub current_node: Option<String>,
    pub visited_nodes: Vec<String>,
    pub execution_path: Vec<String>,
    pub execution_state: Value,
    pub depth: u32,
    pub error: Option<String>,
}

/// Delivery status of a `HandoffArtifact`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Pending,
    Delivered,
    Acknowledged,
    Rejected,
}

/// A structured output of one role consumed by the next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffArtifact {
    pub id: String,
    pub handoff_id: String,
    pub source_role_id: String,
    pub target_role_id: String,
    pub artifact_type: String,
    pub content: Value,
    pub status: HandoffStatus,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

/// Result of a successful `LifecycleManager::spawn` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnResult {
    pub agent_id: String,
    pub session_id: String,
    pub state: AgentState,
    pub sandbox_type: RuntimeClass,
    pub container_id: Option<String>,
    pub pod_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        assert!(AgentState::Pending.can_transition_to(AgentState::Running));
        assert!(AgentState::Running.can_transition_to(AgentState::Suspended));
        assert!(AgentState::Suspended.can_transition_to(AgentState::Running));
        assert!(AgentState::Running.can_transition_to(AgentState::Terminated));
    }

    #[test]
    fn illegal_transitions() {
        assert!(!AgentState::Terminated.can_transition_to(AgentState::Running));
        assert!(!AgentState::Pending.can_transition_to(AgentState::Suspended));
        assert!(!AgentState::Failed.can_transition_to(AgentState::Running));
    }

    #[test]
    fn terminal_states() {
        assert!(AgentState::Terminated.is_terminal());
        assert!(AgentState::Failed.is_terminal());
        assert!(!AgentState::Running.is_terminal());
    }

    #[test]
    fn resource_limits_validate_bounds() {
        assert!(ResourceLimits { cpu_cores: 1.0, memory_mb: 512, tokens_per_hour: 1000 }
            .validate()
            .is_ok());
        assert!(ResourceLimits { cpu_cores: 0.0, memory_mb: 512, tokens_per_hour: 0 }
            .validate()
            .is_err());
        assert!(ResourceLimits { cpu_cores: 33.0, memory_mb: 512, tokens_per_hour: 0 }
            .validate()
            .is_err());
        assert!(ResourceLimits { cpu_cores: 1.0, memory_mb: 0, tokens_per_hour: 0 }
            .validate()
            .is_err());
    }

    #[test]
    fn graph_validation_catches_dangling_edges() {
        let mut nodes = HashMap::new();
        nodes.insert(
            "start".to_string(),
            WorkflowNode { node_id: "start".to_string(), node_type: NodeType::End, config: Value::Null },
        );
        let graph = WorkflowGraph {
            graph_id: "g1".to_string(),
            nodes,
            edges: vec![WorkflowEdge {
                source: "start".to_string(),
                target: "missing".to_string(),
                condition: String::new(),
            }],
            entry_node: "start".to_string(),
        };
        assert!(graph.validate().is_err());
    }
}
