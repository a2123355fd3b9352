//! External collaborator interfaces for the runtime core.
//!
//! Production implementations of the container engine, LLM gateway, and
//! document-MCP subprocess live outside this crate; only these narrow
//! traits plus in-memory/local test doubles ship here.

use super::errors::RuntimeResult;
use super::models::{AgentConfig, ContainerState, SandboxConfiguration};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// The container/VM engine that actually runs an agent process.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn spawn(
        &self,
        config: &AgentConfig,
        sandbox: &SandboxConfiguration,
        env: &HashMap<String, String>,
    ) -> RuntimeResult<String>;

    async fn stop(&self, container_handle: &str, graceful_timeout: std::time::Duration) -> RuntimeResult<()>;

    async fn kill(&self, container_handle: &str) -> RuntimeResult<()>;

    async fn checkpoint(&self, container_handle: &str) -> RuntimeResult<String>;

    async fn restore(&self, container_handle: &str, checkpoint_id: &str) -> RuntimeResult<()>;

    async fn state(&self, container_handle: &str) -> RuntimeResult<ContainerState>;
}

/// Durable checkpoint persistence.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn create_checkpoint(
        &self,
        agent_id: &str,
        session_id: &str,
        state: super::models::AgentState,
        context: Vec<u8>,
        metadata: Value,
    ) -> RuntimeResult<String>;

    async fn restore(&self, checkpoint_id: &str) -> RuntimeResult<Option<super::models::Checkpoint>>;

    async fn list_checkpoints(&self, agent_id: &str, limit: u32) -> RuntimeResult<Vec<super::models::Checkpoint>>;

    async fn cleanup_old(&self, retention_days: i64) -> RuntimeResult<u64>;
}

/// Cache-tier state store. Degrades silently on unavailability.
#[async_trait]
pub trait HotStateStore: Send + Sync {
    async fn save_hot_state(&self, agent_id: &str, data: Value, ttl_seconds: u64);
    async fn load_hot_state(&self, agent_id: &str) -> Option<Value>;
    async fn get_keys(&self, pattern: &str) -> Vec<String>;
    async fn delete(&self, agent_id: &str);
}

/// Outbound state-change notification sink (the L01 event log).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event_type: &str, aggregate_id: &str, payload: Value);
}

/// Token usage reported back by a completed LLM turn.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// A single tool call requested by the model.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub arguments: Value,
}

/// A synchronous inference response.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InferenceResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub token_usage: TokenUsage,
    pub model_id: String,
    pub provider: String,
    pub latency_ms: u64,
    pub cached: bool,
}

/// A streamed delta chunk.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum StreamChunk {
    Start,
    Content { delta: String },
    ToolCall(ToolCall),
    End { tokens_used: u64, content_length: usize },
    Error { error_code: String, message: String },
}

/// The LLM gateway (out of scope for this crate; consumed via this trait).
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn complete(
        &self,
        system_prompt: Option<&str>,
        messages: &[Value],
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> RuntimeResult<InferenceResponse>;

    async fn stream(
        &self,
        system_prompt: Option<&str>,
        messages: &[Value],
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> RuntimeResult<tokio::sync::mpsc::Receiver<StreamChunk>>;
}

/// How a `ToolClient` should behave when its backing MCP subprocess is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpErrorMode {
    FailFast,
    Graceful,
}

/// The authoritative-document MCP subprocess (out of scope; consumed via
/// this trait). `graceful` mode substitutes the canonical stub payloads
/// below instead of failing the turn.
#[async_trait]
pub trait ToolClient: Send + Sync {
    async fn invoke(&self, tool_name: &str, arguments: Value, mode: McpErrorMode) -> RuntimeResult<Value>;
}

/// One-way callback `ResourceManager` uses to signal enforcement decisions
/// to `LifecycleManager`, resolving their cyclic back-reference without
/// a direct dependency in either direction.
#[async_trait]
pub trait QuotaEnforcementSink: Send + Sync {
    async fn enforce(&self, agent_id: &str, action: super::models::EnforcementAction, reason: &str);
}

/// Canonical stub payloads for `McpErrorMode::Graceful`.
pub fn stub_response(kind: &str) -> Value {
    match kind {
        "documents" => serde_json::json!({ "documents": [], "stub": true }),
        "needs_recovery" => serde_json::json!({ "needsRecovery": [], "stub": true }),
        _ => serde_json::json!({ "stub": true }),
    }
}
