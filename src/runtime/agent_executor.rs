//! Single agent turn execution.

use super::errors::{RuntimeError, RuntimeResult};
use super::ports::{InferenceClient, McpErrorMode, StreamChunk, ToolCall, ToolClient};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tracing::{error, warn};

#[derive(Debug, Clone)]
pub struct AgentExecutorConfig {
    pub max_tool_retries: u32,
    pub max_concurrent_tools: usize,
    pub tool_timeout: Duration,
    pub default_temperature: f32,
}

impl Default for AgentExecutorConfig {
    fn default() -> Self {
        Self { max_tool_retries: 3, max_concurrent_tools: 8, tool_timeout: Duration::from_secs(30), default_temperature: 0.7 }
    }
}

/// Per-agent execution context: the running message log and token budget
/// accumulated across turns.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub messages: Vec<Value>,
    pub tools: Vec<String>,
    pub context_window_tokens: u64,
    pub current_tokens: u64,
    pub metadata: HashMap<String, Value>,
}

/// A single tool invocation request.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub arguments: Value,
    pub mcp_mode: McpErrorMode,
}

/// Outcome of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub tool_name: String,
    pub success: bool,
    pub output: Value,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

pub struct AgentExecutor {
    config: AgentExecutorConfig,
    inference: Option<Arc<dyn InferenceClient>>,
    tools: RwLock<HashMap<String, Arc<dyn ToolClient>>>,
    tool_semaphore: Arc<Semaphore>,
    contexts: RwLock<HashMap<String, ExecutionContext>>,
}

impl AgentExecutor {
    pub fn new(config: AgentExecutorConfig, inference: Option<Arc<dyn InferenceClient>>) -> Self {
        let permits = config.max_concurrent_tools;
        Self {
            config,
            inference,
            tools: RwLock::new(HashMap::new()),
            tool_semaphore: Arc::new(Semaphore::new(permits)),
            contexts: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_tool(&self, tool_name: &str, client: Arc<dyn ToolClient>) {
        self.tools.write().await.insert(tool_name.to_string(), client);
    }

    pub async fn init_context(&self, agent_id: &str, context_window_tokens: u64, tools: Vec<String>) {
        self.contexts
            .write()
            .await
            .insert(agent_id.to_string(), ExecutionContext { tools, context_window_tokens, ..Default::default() });
    }

    async fn check_overflow(&self, agent_id: &str) -> RuntimeResult<()> {
        let contexts = self.contexts.read().await;
        if let Some(ctx) = contexts.get(agent_id) {
            if ctx.current_tokens >= ctx.context_window_tokens {
                return Err(RuntimeError::ContextWindowExceeded { used: ctx.current_tokens, window: ctx.context_window_tokens });
            }
        }
        Ok(())
    }

    /// Execute one turn: check overflow, call the inference client (or
    /// return a deterministic stub if none is injected), append messages.
    pub async fn execute(&self, agent_id: &str, system_prompt: Option<&str>, user_message: &str) -> RuntimeResult<Value> {
        self.check_overflow(agent_id).await?;

        let messages = {
            let mut contexts = self.contexts.write().await;
            let ctx = contexts.entry(agent_id.to_string()).or_default();
            ctx.messages.push(serde_json::json!({ "role": "user", "content": user_message }));
            ctx.messages.clone()
        };

        let response = match &self.inference {
            Some(client) => {
                let resp = client.complete(system_prompt, &messages, self.config.default_temperature, None).await?;
                let mut contexts = self.contexts.write().await;
                if let Some(ctx) = contexts.get_mut(agent_id) {
                    ctx.current_tokens += resp.token_usage.total_tokens;
                    ctx.messages.push(serde_json::json!({ "role": "assistant", "content": resp.content }));
                }
                serde_json::to_value(&resp)?
            }
            None => serde_json::json!({
                "content": format!("[stub response for agent {agent_id}]"),
                "tool_calls": [],
                "stub": true,
            }),
        };

        Ok(response)
    }

    pub async fn execute_stream(
        &self,
        agent_id: &str,
        system_prompt: Option<&str>,
        user_message: &str,
    ) -> RuntimeResult<tokio::sync::mpsc::Receiver<StreamChunk>> {
        self.check_overflow(agent_id).await?;
        let messages = {
            let mut contexts = self.contexts.write().await;
            let ctx = contexts.entry(agent_id.to_string()).or_default();
            ctx.messages.push(serde_json::json!({ "role": "user", "content": user_message }));
            ctx.messages.clone()
        };

        match &self.inference {
            Some(client) => client.stream(system_prompt, &messages, self.config.default_temperature, None).await,
            None => {
                let (tx, rx) = tokio::sync::mpsc::channel(4);
                let content = format!("[stub stream for agent {agent_id}]");
                tokio::spawn(async move {
                    let _ = tx.send(StreamChunk::Start).await;
                    let _ = tx.send(StreamChunk::Content { delta: content.clone() }).await;
                    let _ = tx.send(StreamChunk::End { tokens_used: 0, content_length: content.len() }).await;
                });
                Ok(rx)
            }
        }
    }

    /// Invoke a single tool with retry + exponential backoff + timeout,
    /// bounded by the shared `max_concurrent_tools` semaphore.
    pub async fn invoke_tool(&self, agent_id: &str, invocation: ToolInvocation) -> ToolResult {
        let start = Instant::now();
        let client = {
            let tools = self.tools.read().await;
            tools.get(&invocation.tool_name).cloned()
        };
        let Some(client) = client else {
            return ToolResult {
                tool_name: invocation.tool_name.clone(),
                success: false,
                output: Value::Null,
                error: Some(RuntimeError::ToolNotFound(invocation.tool_name).to_string()),
                execution_time_ms: start.elapsed().as_millis() as u64,
            };
        };

        let _permit = match self.tool_semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return ToolResult {
                    tool_name: invocation.tool_name.clone(),
                    success: false,
                    output: Value::Null,
                    error: Some("tool semaphore closed".to_string()),
                    execution_time_ms: start.elapsed().as_millis() as u64,
                }
            }
        };

        let mut attempt = 0;
        loop {
            let call_fut = client.invoke(&invocation.tool_name, invocation.arguments.clone(), invocation.mcp_mode);
            let outcome = tokio::time::timeout(self.config.tool_timeout, call_fut).await;

            match outcome {
                Ok(Ok(value)) => {
                    return ToolResult {
                        tool_name: invocation.tool_name,
                        success: true,
                        output: value,
                        error: None,
                        execution_time_ms: start.elapsed().as_millis() as u64,
                    };
                }
                Ok(Err(err)) if attempt < self.config.max_tool_retries => {
                    attempt += 1;
                    warn!(agent_id, tool = %invocation.tool_name, attempt, %err, "tool invocation failed, retrying");
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                }
                Ok(Err(err)) => {
                    error!(agent_id, tool = %invocation.tool_name, %err, "tool invocation failed permanently");
                    return ToolResult {
                        tool_name: invocation.tool_name,
                        success: false,
                        output: Value::Null,
                        error: Some(err.to_string()),
                        execution_time_ms: start.elapsed().as_millis() as u64,
                    };
                }
                Err(_) if attempt < self.config.max_tool_retries => {
                    attempt += 1;
                    warn!(agent_id, tool = %invocation.tool_name, attempt, "tool invocation timed out, retrying");
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                }
                Err(_) => {
                    return ToolResult {
                        tool_name: invocation.tool_name.clone(),
                        success: false,
                        output: Value::Null,
                        error: Some(RuntimeError::ToolTimeout(invocation.tool_name).to_string()),
                        execution_time_ms: start.elapsed().as_millis() as u64,
                    };
                }
            }
        }
    }

    /// Fan out tool invocations concurrently, preserving input order.
    pub async fn invoke_tools_parallel(&self, agent_id: &str, invocations: Vec<ToolInvocation>) -> Vec<ToolResult> {
        let futures = invocations.into_iter().map(|inv| self.invoke_tool(agent_id, inv));
        futures::future::join_all(futures).await
    }

    pub async fn get_context(&self, agent_id: &str) -> Option<ExecutionContext> {
        self.contexts.read().await.get(agent_id).cloned()
    }
}

/// Helper used by `WorkflowEngine`/`HandoffCoordinator` to coerce a raw
/// tool_call-shaped `Value` into a `ToolCall`.
pub fn parse_tool_call(value: &Value) -> Option<ToolCall> {
    let tool_name = value.get("tool_name")?.as_str()?.to_string();
    let arguments = value.get("arguments").cloned().unwrap_or(Value::Null);
    Some(ToolCall { tool_name, arguments })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FlakyTool {
        failures_before_success: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl ToolClient for FlakyTool {
        async fn invoke(&self, _tool_name: &str, _arguments: Value, _mode: McpErrorMode) -> RuntimeResult<Value> {
            use std::sync::atomic::Ordering;
            if self.failures_before_success.load(Ordering::SeqCst) > 0 {
                self.failures_before_success.fetch_sub(1, Ordering::SeqCst);
                Err(RuntimeError::McpUnavailable("flaky".to_string()))
            } else {
                Ok(serde_json::json!({"ok": true}))
            }
        }
    }

    struct AlwaysFailTool;
    #[async_trait]
    impl ToolClient for AlwaysFailTool {
        async fn invoke(&self, _tool_name: &str, _arguments: Value, _mode: McpErrorMode) -> RuntimeResult<Value> {
            Err(RuntimeError::McpUnavailable("down".to_string()))
        }
    }

    #[tokio::test]
    async fn overflow_check_rejects_before_calling_inference() {
        let executor = AgentExecutor::new(AgentExecutorConfig::default(), None);
        executor.init_context("a1", 10, vec![]).await;
        {
            let mut contexts = executor.contexts.write().await;
            contexts.get_mut("a1").unwrap().current_tokens = 10;
        }
        let err = executor.execute("a1", None, "hi").await.unwrap_err();
        assert!(matches!(err, RuntimeError::ContextWindowExceeded { .. }));
    }

    #[tokio::test]
    async fn stub_response_when_no_inference_client() {
        let executor = AgentExecutor::new(AgentExecutorConfig::default(), None);
        executor.init_context("a1", 1000, vec![]).await;
        let response = executor.execute("a1", None, "hi").await.unwrap();
        assert_eq!(response["stub"], true);
    }

    #[tokio::test]
    async fn invoke_tool_retries_then_succeeds() {
        let executor = AgentExecutor::new(AgentExecutorConfig { max_tool_retries: 2, ..Default::default() }, None);
        executor
            .register_tool("flaky", Arc::new(FlakyTool { failures_before_success: std::sync::atomic::AtomicU32::new(1) }))
            .await;
        let result = executor
            .invoke_tool("a1", ToolInvocation { tool_name: "flaky".to_string(), arguments: Value::Null, mcp_mode: McpErrorMode::FailFast })
            .await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn invoke_tool_exhausts_retries_and_fails() {
        let executor = AgentExecutor::new(AgentExecutorConfig { max_tool_retries: 1, ..Default::default() }, None);
        executor.register_tool("broken", Arc::new(AlwaysFailTool)).await;
        let result = executor
            .invoke_tool("a1", ToolInvocation { tool_name: "broken".to_string(), arguments: Value::Null, mcp_mode: McpErrorMode::FailFast })
            .await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn missing_tool_handler_errors_immediately() {
        let executor = AgentExecutor::new(AgentExecutorConfig::default(), None);
        let result = executor
            .invoke_tool("a1", ToolInvocation { tool_name: "ghost".to_string(), arguments: Value::Null, mcp_mode: McpErrorMode::FailFast })
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn parallel_invocations_preserve_order() {
        let executor = AgentExecutor::new(AgentExecutorConfig::default(), None);
        executor.register_tool("a", Arc::new(AlwaysFailTool)).await;
        executor.register_tool("b", Arc::new(FlakyTool { failures_before_success: std::sync::atomic::AtomicU32::new(0) })).await;
        let results = executor
            .invoke_tools_parallel(
                "a1",
                vec![
                    ToolInvocation { tool_name: "a".to_string(), arguments: Value::Null, mcp_mode: McpErrorMode::FailFast },
                    ToolInvocation { tool_name: "b".to_string(), arguments: Value::Null, mcp_mode: McpErrorMode::FailFast },
                ],
            )
            .await;
        assert_eq!(results[0].tool_name, "a");
        assert_eq!(results[1].tool_name, "b");
        assert!(!results[0].success);
        assert!(results[1].success);
    }
}
