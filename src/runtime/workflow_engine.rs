//! Graph execution over `WorkflowGraph`.

use super::errors::{RuntimeError, RuntimeResult};
use super::models::{NodeType, WorkflowEdge, WorkflowExecution, WorkflowGraph, WorkflowStatus};
use super::ports::CheckpointStore;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct WorkflowEngineConfig {
    pub max_graph_depth: u32,
    pub max_parallel_branches: usize,
    pub detect_cycles: bool,
    pub checkpoint_after_each_node: bool,
}

impl Default for WorkflowEngineConfig {
    fn default() -> Self {
        Self { max_graph_depth: 100, max_parallel_branches: 8, detect_cycles: true, checkpoint_after_each_node: false }
    }
}

/// Evaluate a node-result condition against a deliberately restricted language:
/// literal predicates, `state.`/`result.` dotted-path comparisons, or a
/// restricted expression over `result`/`state`/`depth`/`visited_count`.
pub fn evaluate_condition(condition: &str, result: &Value, state: &Value, depth: u32, visited_count: usize) -> bool {
    let trimmed = condition.trim();
    match trimmed {
        "" | "always" => return true,
        "never" => return false,
        "success" => return !matches!(result.get("success"), Some(Value::Bool(false))) && !result.is_null(),
        "failure" => return matches!(result.get("success"), Some(Value::Bool(false))),
        _ => {}
    }

    if let Some((path_and_op, literal)) = split_comparison(trimmed) {
        let (path, op) = path_and_op;
        let root = if let Some(rest) = path.strip_prefix("state.") {
            (state, rest)
        } else if let Some(rest) = path.strip_prefix("result.") {
            (result, rest)
        } else {
            return false;
        };
        let Some(actual) = dotted_get(root.0, root.1) else { return false };
        return compare(&actual, op, literal.trim());
    }

    evaluate_safe_expression(trimmed, result, state, depth, visited_count).unwrap_or(false)
}

fn split_comparison(expr: &str) -> Option<((&str, &str), &str)> {
    const OPS: [&str; 6] = ["==", "!=", "<=", ">=", "<", ">"];
    for op in OPS {
        if let Some(idx) = expr.find(op) {
            let path = expr[..idx].trim();
            let literal = &expr[idx + op.len()..];
            if path.starts_with("state.") || path.starts_with("result.") {
                return Some(((path, op), literal));
            }
        }
    }
    if let Some(idx) = expr.find(" in ") {
        let path = expr[..idx].trim();
        let literal = &expr[idx + 4..];
        if path.starts_with("state.") || path.starts_with("result.") {
            return Some(((path, "in"), literal));
        }
    }
    None
}

fn dotted_get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn parse_literal(literal: &str) -> Value {
    let literal = literal.trim();
    if let Some(stripped) = literal.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return Value::String(stripped.to_string());
    }
    if let Some(stripped) = literal.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        return Value::String(stripped.to_string());
    }
    if let Ok(n) = literal.parse::<f64>() {
        return serde_json::json!(n);
    }
    match literal {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(literal.to_string()),
    }
}

fn compare(actual: &Value, op: &str, literal: &str) -> bool {
    let expected = parse_literal(literal);
    match op {
        "==" => actual == &expected,
        "!=" => actual != &expected,
        "in" => {
            let needle = literal.trim().trim_matches(|c| c == '[' || c == ']');
            needle.split(',').map(str::trim).any(|item| parse_literal(item) == *actual)
        }
        "<" | "<=" | ">" | ">=" => match (actual.as_f64(), expected.as_f64()) {
            (Some(a), Some(b)) => match op {
                "<" => a < b,
                "<=" => a <= b,
                ">" => a > b,
                _ => a >= b,
            },
            _ => false,
        },
        _ => false,
    }
}

/// Forbid anything resembling a call or import; everything else is parsed
/// as a bare dotted-path comparison fallback (same evaluator as above), so
/// an expression that isn't literally dangerous but isn't a recognized
/// shape just evaluates to false.
fn evaluate_safe_expression(expr: &str, _result: &Value, _state: &Value, _depth: u32, _visited_count: usize) -> Option<bool> {
    if expr.contains('(') || expr.contains(')') || expr.contains("import") || expr.contains("__") {
        return Some(false);
    }
    None
}

struct PendingExecution {
    execution: WorkflowExecution,
}

/// Executes `WorkflowGraph`s and supports checkpoint-based resume.
pub struct WorkflowEngine {
    config: WorkflowEngineConfig,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    executions: RwLock<HashMap<String, PendingExecution>>,
    parallel_semaphore: Arc<Semaphore>,
}

impl WorkflowEngine {
    pub fn new(config: WorkflowEngineConfig, checkpoint_store: Option<Arc<dyn CheckpointStore>>) -> Self {
        let permits = config.max_parallel_branches;
        Self { config, checkpoint_store, executions: RwLock::new(HashMap::new()), parallel_semaphore: Arc::new(Semaphore::new(permits)) }
    }

    /// Simulates executing one node; production wiring would delegate
    /// `Agent` nodes to `AgentExecutor`. Returns a result `Value` consumed
    /// by condition evaluation for the next hop.
    async fn run_node(&self, node_type: &NodeType) -> Value {
        match node_type {
            NodeType::Agent { role } => serde_json::json!({ "success": true, "role": role }),
            NodeType::Conditional => serde_json::json!({ "success": true }),
            NodeType::Parallel { children } => serde_json::json!({ "success": true, "children": children }),
            NodeType::End => serde_json::json!({ "success": true, "terminal": true }),
        }
    }

    fn select_next<'a>(&self, graph: &'a WorkflowGraph, node_id: &str, node_type: &NodeType, result: &Value, state: &Value, depth: u32, visited_count: usize) -> Option<&'a WorkflowEdge> {
        let edges = graph.outgoing(node_id);
        match node_type {
            NodeType::Conditional => {
                let mut default_edge = None;
                for edge in &edges {
                    if edge.condition.is_empty() {
                        default_edge = Some(*edge);
                        continue;
                    }
                    if evaluate_condition(&edge.condition, result, state, depth, visited_count) {
                        return Some(*edge);
                    }
                }
                default_edge
            }
            _ => edges.first().copied(),
        }
    }

    /// Execute a workflow graph from its entry node to completion (or error).
    pub async fn execute_workflow(&self, graph: WorkflowGraph, initial_state: Value) -> RuntimeResult<WorkflowExecution> {
        graph.validate().map_err(RuntimeError::InvalidWorkflowGraph)?;

        let execution_id = Uuid::new_v4().to_string();
        let mut execution = WorkflowExecution {
            execution_id: execution_id.clone(),
            graph: graph.clone(),
            status: WorkflowStatus::Running,
            current_node: Some(graph.entry_node.clone()),
            visited_nodes: Vec::new(),
            execution_path: Vec::new(),
            execution_state: initial_state,
            depth: 0,
            error: None,
        };

        let result = self.run_to_completion(&mut execution).await;
        match result {
            Ok(()) => execution.status = WorkflowStatus::Completed,
            Err(err) => {
                execution.status = WorkflowStatus::Failed;
                execution.error = Some(err.to_string());
                self.executions.write().await.insert(execution_id, PendingExecution { execution: execution.clone() });
                return Err(err);
            }
        }
        self.executions.write().await.insert(execution_id, PendingExecution { execution: execution.clone() });
        Ok(execution)
    }

    async fn run_to_completion(&self, execution: &mut WorkflowExecution) -> RuntimeResult<()> {
        loop {
            let Some(node_id) = execution.current_node.clone() else { return Ok(()) };

            if self.config.detect_cycles && execution.visited_nodes.contains(&node_id) {
                return Err(RuntimeError::CycleDetected(node_id));
            }
            if execution.depth >= self.config.max_graph_depth {
                return Err(RuntimeError::GraphDepthExceeded { depth: execution.depth, max: self.config.max_graph_depth });
            }

            let node = execution
                .graph
                .nodes
                .get(&node_id)
                .ok_or_else(|| RuntimeError::InvalidWorkflowGraph(format!("node {node_id} missing")))?
                .clone();

            let result = if let NodeType::Parallel { children } = &node.node_type {
                self.run_parallel(children, execution).await
            } else {
                self.run_node(&node.node_type).await
            };

            execution.visited_nodes.push(node_id.clone());
            execution.execution_path.push(node_id.clone());
            execution.depth += 1;

            if self.config.checkpoint_after_each_node {
                if let Some(store) = &self.checkpoint_store {
                    let metadata = serde_json::json!({
                        "execution_path": execution.execution_path,
                        "visited_nodes": execution.visited_nodes,
                        "depth": execution.depth,
                        "graph": execution.graph,
                    });
                    let context = serde_json::to_vec(&execution.execution_state).unwrap_or_default();
                    let _ = store.create_checkpoint(&execution.execution_id, &execution.execution_id, super::models::AgentState::Running, context, metadata).await;
                }
            }

            if matches!(node.node_type, NodeType::End) {
                execution.current_node = None;
                return Ok(());
            }

            let visited_count = execution.visited_nodes.len();
            let next_edge = self.select_next(&execution.graph, &node_id, &node.node_type, &result, &execution.execution_state, execution.depth, visited_count);
            execution.current_node = next_edge.map(|e| e.target.clone());

            if execution.current_node.is_none() {
                return Ok(());
            }
        }
    }

    async fn run_parallel(&self, children: &[String], execution: &WorkflowExecution) -> Value {
        let mut handles = Vec::new();
        for child in children {
            let node_type = execution.graph.nodes.get(child).map(|n| n.node_type.clone());
            let permit = self.parallel_semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.ok();
                match node_type {
                    Some(NodeType::Agent { role }) => serde_json::json!({ "success": true, "role": role }),
                    _ => serde_json::json!({ "success": true }),
                }
            }));
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap_or(Value::Null));
        }
        serde_json::json!({ "success": true, "branch_results": results })
    }

    /// Find the resume node: empty path resumes at the
    /// entry node; otherwise take the last node's first outgoing edge
    /// targeting an unvisited node. `None`/`End` with no such edge means
    /// the workflow is already complete.
    pub fn find_resume_node(graph: &WorkflowGraph, execution_path: &[String], visited_nodes: &[String]) -> RuntimeResult<Option<String>> {
        let Some(last) = execution_path.last() else {
            return Ok(Some(graph.entry_node.clone()));
        };
        if let Some(node) = graph.nodes.get(last) {
            if matches!(node.node_type, NodeType::End) {
                return Ok(None);
            }
        }
        for edge in graph.outgoing(last) {
            if !visited_nodes.contains(&edge.target) {
                return Ok(Some(edge.target.clone()));
            }
        }
        Ok(None)
    }

    /// Resume a previously checkpointed (or in-memory) execution.
    pub async fn resume_workflow(&self, execution_id: &str, checkpoint_id: Option<&str>) -> RuntimeResult<WorkflowExecution> {
        let mut execution = if let (Some(store), Some(cp_id)) = (&self.checkpoint_store, checkpoint_id) {
            let checkpoint = store
                .restore(cp_id)
                .await?
                .ok_or_else(|| RuntimeError::CheckpointNotFound(cp_id.to_string()))?;
            let graph: WorkflowGraph = serde_json::from_value(checkpoint.metadata.get("graph").cloned().unwrap_or(Value::Null))?;
            let visited_nodes: Vec<String> = serde_json::from_value(checkpoint.metadata.get("visited_nodes").cloned().unwrap_or(Value::Array(vec![])))?;
            let execution_path: Vec<String> = serde_json::from_value(checkpoint.metadata.get("execution_path").cloned().unwrap_or(Value::Array(vec![])))?;
            let depth: u32 = serde_json::from_value(checkpoint.metadata.get("depth").cloned().unwrap_or(serde_json::json!(0)))?;
            let execution_state: Value = serde_json::from_slice(&checkpoint.context).unwrap_or(Value::Null);
            WorkflowExecution {
                execution_id: execution_id.to_string(),
                graph,
                status: WorkflowStatus::Running,
                current_node: None,
                visited_nodes,
                execution_path,
                execution_state,
                depth,
                error: None,
            }
        } else {
            let mut executions = self.executions.write().await;
            let pending = executions.get_mut(execution_id).ok_or_else(|| RuntimeError::WorkflowExecutionNotFound(execution_id.to_string()))?;
            pending.execution.clone()
        };

        let resume_node = Self::find_resume_node(&execution.graph, &execution.execution_path, &execution.visited_nodes)?;
        let Some(resume_node) = resume_node else {
            return Err(RuntimeError::WorkflowAlreadyComplete(execution_id.to_string()));
        };

        execution.current_node = Some(resume_node);
        execution.status = WorkflowStatus::Running;

        let result = self.run_to_completion(&mut execution).await;
        match result {
            Ok(()) => execution.status = WorkflowStatus::Completed,
            Err(err) => {
                execution.status = WorkflowStatus::Failed;
                execution.error = Some(err.to_string());
                self.executions.write().await.insert(execution_id.to_string(), PendingExecution { execution: execution.clone() });
                return Err(err);
            }
        }
        self.executions.write().await.insert(execution_id.to_string(), PendingExecution { execution: execution.clone() });
        info!(execution_id, "workflow resumed to completion");
        Ok(execution)
    }

    pub async fn get_execution(&self, execution_id: &str) -> Option<WorkflowExecution> {
        self.executions.read().await.get(execution_id).map(|p| p.execution.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn linear_graph() -> WorkflowGraph {
        let mut nodes = Map::new();
        nodes.insert("start".to_string(), super::super::models::WorkflowNode { node_id: "start".to_string(), node_type: NodeType::Agent { role: "writer".to_string() }, config: Value::Null });
        nodes.insert("end".to_string(), super::super::models::WorkflowNode { node_id: "end".to_string(), node_type: NodeType::End, config: Value::Null });
        WorkflowGraph {
            graph_id: "g1".to_string(),
            nodes,
            edges: vec![WorkflowEdge { source: "start".to_string(), target: "end".to_string(), condition: String::new() }],
            entry_node: "start".to_string(),
        }
    }

    #[tokio::test]
    async fn executes_linear_graph_to_completion() {
        let engine = WorkflowEngine::new(WorkflowEngineConfig::default(), None);
        let execution = engine.execute_workflow(linear_graph(), Value::Null).await.unwrap();
        assert_eq!(execution.status, WorkflowStatus::Completed);
        assert_eq!(execution.execution_path, vec!["start".to_string(), "end".to_string()]);
    }

    #[tokio::test]
    async fn exceeding_max_depth_errors() {
        let mut nodes = Map::new();
        nodes.insert("a".to_string(), super::super::models::WorkflowNode { node_id: "a".to_string(), node_type: NodeType::Agent { role: "x".to_string() }, config: Value::Null });
        let looping = WorkflowGraph {
            graph_id: "loop".to_string(),
            nodes,
            edges: vec![WorkflowEdge { source: "a".to_string(), target: "a".to_string(), condition: String::new() }],
            entry_node: "a".to_string(),
        };
        let engine = WorkflowEngine::new(WorkflowEngineConfig { max_graph_depth: 3, detect_cycles: false, ..Default::default() }, None);
        let err = engine.execute_workflow(looping, Value::Null).await.unwrap_err();
        assert!(matches!(err, RuntimeError::GraphDepthExceeded { .. }));
    }

    #[tokio::test]
    async fn cycle_detection_errors_on_revisit() {
        let mut nodes = Map::new();
        nodes.insert("a".to_string(), super::super::models::WorkflowNode { node_id: "a".to_string(), node_type: NodeType::Agent { role: "x".to_string() }, config: Value::Null });
        let looping = WorkflowGraph {
            graph_id: "loop".to_string(),
            nodes,
            edges: vec![WorkflowEdge { source: "a".to_string(), target: "a".to_string(), condition: String::new() }],
            entry_node: "a".to_string(),
        };
        let engine = WorkflowEngine::new(WorkflowEngineConfig::default(), None);
        let err = engine.execute_workflow(looping, Value::Null).await.unwrap_err();
        assert!(matches!(err, RuntimeError::CycleDetected(_)));
    }

    #[test]
    fn condition_literals() {
        assert!(evaluate_condition("always", &Value::Null, &Value::Null, 0, 0));
        assert!(!evaluate_condition("never", &Value::Null, &Value::Null, 0, 0));
        assert!(evaluate_condition("success", &serde_json::json!({"success": true}), &Value::Null, 0, 0));
        assert!(evaluate_condition("failure", &serde_json::json!({"success": false}), &Value::Null, 0, 0));
    }

    #[test]
    fn condition_dotted_path_comparison() {
        let state = serde_json::json!({"retries": 3});
        assert!(evaluate_condition("state.retries >= 3", &Value::Null, &state, 0, 0));
        assert!(!evaluate_condition("state.retries > 3", &Value::Null, &state, 0, 0));
    }

    #[test]
    fn condition_rejects_call_syntax() {
        assert!(!evaluate_condition("state.retries == __import__('os')", &Value::Null, &serde_json::json!({}), 0, 0));
    }

    #[test]
    fn resume_node_empty_path_is_entry() {
        let graph = linear_graph();
        let resume = WorkflowEngine::find_resume_node(&graph, &[], &[]).unwrap();
        assert_eq!(resume, Some("start".to_string()));
    }

    #[test]
    fn resume_node_after_last_executed() {
        let graph = linear_graph();
        let resume = WorkflowEngine::find_resume_node(&graph, &["start".to_string()], &["start".to_string()]).unwrap();
        assert_eq!(resume, Some("end".to_string()));
    }

    #[test]
    fn resume_node_already_complete_at_end() {
        let graph = linear_graph();
        let resume = WorkflowEngine::find_resume_node(&graph, &["start".to_string(), "end".to_string()], &["start".to_string(), "end".to_string()]).unwrap();
        assert_eq!(resume, None);
    }
}
