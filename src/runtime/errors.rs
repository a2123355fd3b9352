//! Error taxonomy for the agent runtime core.

use thiserror::Error;

/// Coarse kind used by the (out-of-scope) HTTP layer to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Timeout,
    Unavailable,
    Transient,
    Fatal,
    SafetyRelevant,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("invalid state transition for {agent_id}: {from:?} -> {to:?}")]
    InvalidStateTransition { agent_id: String, from: String, to: String },

    #[error("spawn timed out after {0:?}")]
    SpawnTimeout(std::time::Duration),

    #[error("sandbox error: {0}")]
    SandboxError(String),

    #[error("privilege escalation requested but not permitted")]
    PrivilegeEscalationRequired,

    #[error("quota invalid: {0}")]
    QuotaInvalid(String),

    #[error("quota exceeded for {scope}: {resource}")]
    QuotaExceeded { scope: String, resource: String },

    #[error("termination failed: {0}")]
    TerminationFailed(String),

    #[error("drain timed out after {0:?}")]
    DrainTimeout(std::time::Duration),

    #[error("checkpoint too large: {size} bytes > max {max}")]
    CheckpointTooLarge { size: usize, max: usize },

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("context window exceeded: {used}/{window} tokens")]
    ContextWindowExceeded { used: u64, window: u64 },

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool invocation timed out: {0}")]
    ToolTimeout(String),

    #[error("graph depth exceeded: {depth} > max {max}")]
    GraphDepthExceeded { depth: u32, max: u32 },

    #[error("cycle detected at node {0}")]
    CycleDetected(String),

    #[error("workflow execution not found: {0}")]
    WorkflowExecutionNotFound(String),

    #[error("workflow already complete: {0}")]
    WorkflowAlreadyComplete(String),

    #[error("invalid workflow graph: {0}")]
    InvalidWorkflowGraph(String),

    #[error("handoff not found: {0}")]
    HandoffNotFound(String),

    #[error("role execution failed: {role}: {message}")]
    RoleExecutionFailed { role: String, message: String },

    #[error("MCP unavailable: {0}")]
    McpUnavailable(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RuntimeError {
    /// Stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AgentNotFound(_) => "E2000",
            Self::InvalidStateTransition { .. } => "E2001",
            Self::ContextWindowExceeded { .. } => "E2003",
            Self::SandboxError(_) => "E2020",
            Self::SpawnTimeout(_) => "E2021",
            Self::TerminationFailed(_) => "E2022",
            Self::CheckpointNotFound(_) => "E2024",
            Self::DrainTimeout(_) => "E2093",
            Self::QuotaInvalid(_) => "E2073",
            Self::QuotaExceeded { .. } => "E2074",
            Self::PrivilegeEscalationRequired => "E2044",
            Self::ToolTimeout(_) => "E2002",
            Self::ToolNotFound(_) => "E2004",
            Self::McpUnavailable(_) => "E2055",
            Self::GraphDepthExceeded { .. } => "E2090",
            Self::CycleDetected(_) => "E2091",
            Self::WorkflowExecutionNotFound(_) => "E2023",
            Self::WorkflowAlreadyComplete(_) => "E2092",
            Self::InvalidWorkflowGraph(_) => "E2094",
            Self::HandoffNotFound(_) => "E2095",
            Self::RoleExecutionFailed { .. } => "E2096",
            Self::CheckpointTooLarge { .. } => "E2097",
            Self::Database(_) => "E2098",
            Self::Serialization(_) => "E2099",
        }
    }

    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::AgentNotFound(_)
            | Self::CheckpointNotFound(_)
            | Self::WorkflowExecutionNotFound(_)
            | Self::HandoffNotFound(_)
            | Self::ToolNotFound(_) => ErrorKind::NotFound,
            Self::InvalidStateTransition { .. }
            | Self::QuotaInvalid(_)
            | Self::CheckpointTooLarge { .. }
            | Self::ContextWindowExceeded { .. }
            | Self::InvalidWorkflowGraph(_)
            | Self::GraphDepthExceeded { .. }
            | Self::CycleDetected(_)
            | Self::WorkflowAlreadyComplete(_) => ErrorKind::InvalidInput,
            Self::SpawnTimeout(_) | Self::ToolTimeout(_) | Self::DrainTimeout(_) => ErrorKind::Timeout,
            Self::SandboxError(_) | Self::McpUnavailable(_) | Self::Database(_) => ErrorKind::Unavailable,
            Self::QuotaExceeded { .. } | Self::RoleExecutionFailed { .. } => ErrorKind::Transient,
            Self::PrivilegeEscalationRequired => ErrorKind::SafetyRelevant,
            Self::TerminationFailed(_) => ErrorKind::Fatal,
            Self::Serialization(_) => ErrorKind::Fatal,
        }
    }
}

impl From<sqlx::Error> for RuntimeError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
