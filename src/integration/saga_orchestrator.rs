//! Saga orchestration with reverse-order compensation.

use super::errors::{IntegrationError, IntegrationResult};
use super::models::{RequestContext, SagaExecution, SagaStatus, StepStatus, StepTrace};
use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

/// The forward (and optional compensating) action of one saga step.
#[async_trait]
pub trait SagaAction: Send + Sync {
    /// Runs the step against the current saga context, returning the
    /// partial context to merge on success.
    async fn run(&self, context: &Value) -> Result<Value, String>;
}

#[async_trait]
pub trait CompensationAction: Send + Sync {
    async fn compensate(&self, context: &Value) -> Result<(), String>;
}

pub struct SagaStep {
    pub name: String,
    pub action: Arc<dyn SagaAction>,
    pub compensation: Option<Arc<dyn CompensationAction>>,
    pub timeout: Duration,
    pub retry_on_failure: bool,
    pub max_retries: u32,
    pub required: bool,
}

pub struct SagaDefinition {
    pub name: String,
    pub steps: Vec<SagaStep>,
    pub timeout: Duration,
    pub auto_compensate: bool,
}

impl SagaDefinition {
    pub fn validate(&self) -> IntegrationResult<()> {
        if self.steps.is_empty() {
            return Err(IntegrationError::InvalidSagaDefinition(format!("{}: saga has no steps", self.name)));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.clone()) {
                return Err(IntegrationError::InvalidSagaDefinition(format!(
                    "{}: duplicate step name {}",
                    self.name, step.name
                )));
            }
        }
        Ok(())
    }
}

struct Completed {
    index: usize,
    context_at_completion: Value,
}

pub struct SagaOrchestrator {
    executions: Arc<RwLock<HashMap<String, SagaExecution>>>,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for SagaOrchestrator {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(30))
    }
}

impl SagaOrchestrator {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self { executions: Arc::new(RwLock::new(HashMap::new())), base_delay, max_delay }
    }

    pub async fn get_execution(&self, execution_id: &str) -> IntegrationResult<SagaExecution> {
        self.executions
            .read()
            .await
            .get(execution_id)
            .cloned()
            .ok_or_else(|| IntegrationError::SagaNotFound(execution_id.to_string()))
    }

    /// `get_execution_trace`: per-step timings/retries/errors and the final
    /// context snapshot.
    pub async fn get_execution_trace(&self, execution_id: &str) -> IntegrationResult<SagaExecution> {
        self.get_execution(execution_id).await
    }

    pub async fn execute_saga(
        &self,
        definition: &SagaDefinition,
        context: Value,
        trace_ctx: Option<RequestContext>,
    ) -> IntegrationResult<SagaExecution> {
        definition.validate()?;
        let ctx = trace_ctx.unwrap_or_else(RequestContext::new_root);
        let execution_id = Uuid::new_v4().to_string();
        let mut execution = SagaExecution {
            execution_id: execution_id.clone(),
            status: SagaStatus::Running,
            current_step_index: 0,
            context,
            step_traces: definition.steps.iter().map(|s| StepTrace::pending(&s.name)).collect(),
            started_at: chrono::Utc::now(),
            completed_at: None,
            error: None,
            trace_id: ctx.trace_id.clone(),
        };
        self.executions.write().await.insert(execution_id.clone(), execution.clone());

        let deadline = Instant::now() + definition.timeout;
        let mut completed: Vec<Completed> = Vec::new();

        for (index, step) in definition.steps.iter().enumerate() {
            execution.current_step_index = index;

            if Instant::now() >= deadline {
                execution.status = SagaStatus::Timeout;
                execution.error = Some(format!("saga timed out before step {}", step.name));
                self.save(&execution).await;
                if definition.auto_compensate {
                    self.compensate(definition, &mut execution, &completed, SagaStatus::Timeout).await;
                }
                return Err(IntegrationError::SagaTimeout(step.name.clone()));
            }

            let trace = &mut execution.step_traces[index];
            trace.status = StepStatus::Running;
            trace.started_at = Some(chrono::Utc::now());

            match self.run_with_retry(step, &execution.context).await {
                Ok(partial) => {
                    merge_context(&mut execution.context, partial);
                    let trace = &mut execution.step_traces[index];
                    trace.status = StepStatus::Completed;
                    trace.completed_at = Some(chrono::Utc::now());
                    completed.push(Completed { index, context_at_completion: execution.context.clone() });
                }
                Err((message, attempts)) => {
                    let trace = &mut execution.step_traces[index];
                    trace.attempts = attempts;
                    if step.required {
                        trace.status = StepStatus::Failed;
                        trace.error = Some(message.clone());
                        execution.status = SagaStatus::Failed;
                        execution.error = Some(format!("{}: {}", step.name, message));
                        self.save(&execution).await;
                        if definition.auto_compensate {
                            self.compensate(definition, &mut execution, &completed, SagaStatus::Failed).await;
                        }
                        return Err(IntegrationError::StepFailed { step: step.name.clone(), message });
                    }
                    trace.status = StepStatus::Skipped;
                    trace.error = Some(message);
                    warn!(step = %step.name, "optional saga step failed, continuing");
                }
            }
            self.save(&execution).await;
        }

        execution.status = SagaStatus::Completed;
        execution.current_step_index = definition.steps.len();
        execution.completed_at = Some(chrono::Utc::now());
        self.save(&execution).await;
        Ok(execution)
    }

    async fn run_with_retry(&self, step: &SagaStep, context: &Value) -> Result<Value, (String, u32)> {
        let max_attempts = if step.retry_on_failure { step.max_retries.max(1) } else { 1 };
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let outcome = tokio::time::timeout(step.timeout, step.action.run(context)).await;
            match outcome {
                Ok(Ok(partial)) => return Ok(partial),
                Ok(Err(message)) => last_error = message,
                Err(_) => last_error = format!("step {} timed out after {:?}", step.name, step.timeout),
            }

            if attempt < max_attempts {
                let delay = backoff_with_jitter(self.base_delay, self.max_delay, attempt);
                tokio::time::sleep(delay).await;
            }
        }
        Err((last_error, max_attempts))
    }

    /// Walk completed steps in reverse order; best-effort — a compensation
    /// failure doesn't stop the reverse sweep for the remaining steps.
    /// Reports the first failure via `CompensationFailed`. Restores
    /// `terminal_status` (the saga's actual outcome) once the sweep
    /// completes, since the stored record must end `Failed`/`Timeout`,
    /// never `Compensating`.
    async fn compensate(
        &self,
        definition: &SagaDefinition,
        execution: &mut SagaExecution,
        completed: &[Completed],
        terminal_status: SagaStatus,
    ) {
        execution.status = SagaStatus::Compensating;
        self.save(execution).await;

        let mut first_failure: Option<(String, String)> = None;
        for entry in completed.iter().rev() {
            let step = &definition.steps[entry.index];
            let Some(compensation) = &step.compensation else { continue };
            match compensation.compensate(&entry.context_at_completion).await {
                Ok(()) => {
                    execution.step_traces[entry.index].status = StepStatus::Compensated;
                }
                Err(message) => {
                    error!(step = %step.name, %message, "compensation failed, continuing reverse sweep");
                    execution.step_traces[entry.index].status = StepStatus::CompensationFailed;
                    if first_failure.is_none() {
                        first_failure = Some((step.name.clone(), message));
                    }
                }
            }
        }

        if let Some((step, message)) = first_failure {
            execution.error = Some(format!("compensation failed at {step}: {message}"));
        }
        execution.status = terminal_status;
        self.save(execution).await;
    }

    /// `retry_saga`: start a fresh execution with the original context and
    /// definition.
    pub async fn retry_saga(&self, definition: &SagaDefinition, original_context: Value) -> IntegrationResult<SagaExecution> {
        info!(saga = %definition.name, "retrying saga with a fresh execution");
        self.execute_saga(definition, original_context, None).await
    }

    async fn save(&self, execution: &SagaExecution) {
        self.executions.write().await.insert(execution.execution_id.clone(), execution.clone());
    }
}

fn merge_context(context: &mut Value, partial: Value) {
    if let (Value::Object(base), Value::Object(extra)) = (context, partial) {
        for (k, v) in extra {
            base.insert(k, v);
        }
    }
}

/// `base * 2^(attempt-1)`, capped at `max_delay`, with +/-25% jitter,
/// floored at 100ms.
fn backoff_with_jitter(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
    let capped = exp.min(max.as_secs_f64());
    let jitter_factor = rand::thread_rng().gen_range(0.75..=1.25);
    let jittered = (capped * jitter_factor).max(0.1);
    Duration::from_secs_f64(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Ok1;
    #[async_trait]
    impl SagaAction for Ok1 {
        async fn run(&self, _context: &Value) -> Result<Value, String> {
            Ok(serde_json::json!({"a": 1}))
        }
    }

    struct AlwaysFails;
    #[async_trait]
    impl SagaAction for AlwaysFails {
        async fn run(&self, _context: &Value) -> Result<Value, String> {
            Err("step B failed".to_string())
        }
    }

    struct RecordingCompensation(Arc<AtomicU32>);
    #[async_trait]
    impl CompensationAction for RecordingCompensation {
        async fn compensate(&self, _context: &Value) -> Result<(), String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn two_step_saga_compensates_step_one_exactly_once_on_step_two_failure() {
        let compensations = Arc::new(AtomicU32::new(0));
        let definition = SagaDefinition {
            name: "order".to_string(),
            steps: vec![
                SagaStep {
                    name: "A".to_string(),
                    action: Arc::new(Ok1),
                    compensation: Some(Arc::new(RecordingCompensation(compensations.clone()))),
                    timeout: Duration::from_secs(1),
                    retry_on_failure: false,
                    max_retries: 1,
                    required: true,
                },
                SagaStep {
                    name: "B".to_string(),
                    action: Arc::new(AlwaysFails),
                    compensation: None,
                    timeout: Duration::from_secs(1),
                    retry_on_failure: false,
                    max_retries: 1,
                    required: true,
                },
            ],
            timeout: Duration::from_secs(5),
            auto_compensate: true,
        };

        let orchestrator = SagaOrchestrator::default();
        let err = orchestrator.execute_saga(&definition, serde_json::json!({}), None).await.unwrap_err();
        assert!(matches!(err, IntegrationError::StepFailed { .. }));

        assert_eq!(compensations.load(Ordering::SeqCst), 1);
        let execution = orchestrator.get_execution_trace(
            &orchestrator.executions.read().await.keys().next().unwrap().clone()
        ).await.unwrap();
        assert_eq!(execution.status, SagaStatus::Failed);
        assert!(execution.error.as_deref().unwrap_or_default().contains('B'));
    }

    #[tokio::test]
    async fn empty_saga_is_rejected() {
        let definition = SagaDefinition { name: "empty".to_string(), steps: vec![], timeout: Duration::from_secs(1), auto_compensate: false };
        let orchestrator = SagaOrchestrator::default();
        let err = orchestrator.execute_saga(&definition, serde_json::json!({}), None).await.unwrap_err();
        assert!(matches!(err, IntegrationError::InvalidSagaDefinition(_)));
    }

    #[test]
    fn backoff_never_below_100ms_and_respects_cap() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        for attempt in 1..8 {
            let delay = backoff_with_jitter(base, max, attempt);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_secs_f64(1.25));
        }
    }
}
