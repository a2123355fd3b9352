//! Data model for the integration core (L11).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Health status of a registered service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Healthy,
    Unhealthy,
    Degraded,
    Unknown,
}

/// The probe used to determine a service's health.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeKind {
    Http { path: String },
    Tcp,
    RedisPing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub probe: ProbeKind,
    pub interval: std::time::Duration,
    pub timeout: std::time::Duration,
    pub success_threshold: u32,
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            probe: ProbeKind::Tcp,
            interval: std::time::Duration::from_secs(10),
            timeout: std::time::Duration::from_secs(2),
            success_threshold: 2,
            failure_threshold: 3,
        }
    }
}

/// One registered instance of a logical service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service_id: String,
    pub service_name: String,
    pub endpoint: String,
    pub status: ServiceStatus,
    pub health_check_config: HealthCheckConfig,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub heartbeat_at: DateTime<Utc>,
}

impl ServiceInfo {
    pub fn new(service_name: impl Into<String>, endpoint: impl Into<String>, health_check_config: HealthCheckConfig) -> Self {
        Self {
            service_id: Uuid::new_v4().to_string(),
            service_name: service_name.into(),
            endpoint: endpoint.into(),
            status: ServiceStatus::Unknown,
            health_check_config,
            last_probe_at: None,
            heartbeat_at: Utc::now(),
        }
    }
}

/// State of a per-service circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_sec: f64,
    pub error_rate_threshold: f64,
    pub window_size_sec: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_sec: 30.0,
            error_rate_threshold: 0.5,
            window_size_sec: 60.0,
        }
    }
}

/// Priority of an event message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for EventPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Metadata envelope carried by every event message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: String,
    pub trace_id: Option<String>,
    pub correlation_id: Option<String>,
    pub source: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub priority: EventPriority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub tags: Vec<String>,
}

impl EventMetadata {
    pub fn new(source: Option<String>, max_retries: u32) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            trace_id: None,
            correlation_id: None,
            source,
            timestamp: Utc::now(),
            priority: EventPriority::Normal,
            retry_count: 0,
            max_retries,
            tags: Vec::new(),
        }
    }
}

/// A pub/sub message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub topic: String,
    pub event_type: String,
    pub payload: Value,
    pub metadata: EventMetadata,
    pub schema_version: u32,
}

impl EventMessage {
    pub fn new(topic: impl Into<String>, event_type: impl Into<String>, payload: Value, max_retries: u32) -> Self {
        Self {
            topic: topic.into(),
            event_type: event_type.into(),
            payload,
            metadata: EventMetadata::new(None, max_retries),
            schema_version: 1,
        }
    }
}

/// A dead-lettered event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub event: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Overall status of a saga execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Pending,
    Running,
    Compensating,
    Completed,
    Failed,
    Timeout,
}

/// Per-step outcome tracked in a saga's trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
    Compensated,
    CompensationFailed,
}

/// Timing/error trace recorded for one executed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTrace {
    pub step_name: String,
    pub status: StepStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StepTrace {
    pub fn pending(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// Mutable execution record for a running/completed saga.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaExecution {
    pub execution_id: String,
    pub status: SagaStatus,
    pub current_step_index: usize,
    pub context: Value,
    pub step_traces: Vec<StepTrace>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub trace_id: String,
}

/// Propagated request context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub correlation_id: String,
    pub baggage: HashMap<String, String>,
    pub trace_flags: u8,
}

impl RequestContext {
    pub fn new_root() -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            span_id: new_span_id(),
            parent_span_id: None,
            correlation_id: Uuid::new_v4().to_string(),
            baggage: HashMap::new(),
            trace_flags: 1,
        }
    }

    /// Derive a child context: same `trace_id`/`correlation_id`/baggage, fresh `span_id`.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            parent_span_id: Some(self.span_id.clone()),
            correlation_id: self.correlation_id.clone(),
            baggage: self.baggage.clone(),
            trace_flags: self.trace_flags,
        }
    }

    /// Serialize to the W3C `traceparent`/`baggage`/correlation headers.
    pub fn to_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert(
            "traceparent".to_string(),
            format!("00-{}-{}-{:02x}", self.trace_id, self.span_id, self.trace_flags),
        );
        headers.insert("x-correlation-id".to_string(), self.correlation_id.clone());
        if !self.baggage.is_empty() {
            let baggage = self
                .baggage
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            headers.insert("baggage".to_string(), baggage);
        }
        headers
    }

    /// Parse a `RequestContext` back from propagated headers. Generates a
    /// fresh root context if `traceparent` is missing or malformed.
    pub fn from_headers(headers: &HashMap<String, String>) -> Self {
        let correlation_id = headers
            .get("x-correlation-id")
            .cloned()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let baggage = headers
            .get("baggage")
            .map(|raw| {
                raw.split(',')
                    .filter_map(|pair| {
                        let mut parts = pair.splitn(2, '=');
                        let key = parts.next()?.trim();
                        let value = parts.next()?.trim();
                        if key.is_empty() {
                            None
                        } else {
                            Some((key.to_string(), value.to_string()))
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        match headers.get("traceparent").and_then(|raw| parse_traceparent(raw)) {
            Some((trace_id, span_id, flags)) => Self {
                trace_id,
                span_id: new_span_id(),
                parent_span_id: Some(span_id),
                correlation_id,
                baggage,
                trace_flags: flags,
            },
            None => Self {
                trace_id: Uuid::new_v4().simple().to_string(),
                span_id: new_span_id(),
                parent_span_id: None,
                correlation_id,
                baggage,
                trace_flags: 1,
            },
        }
    }
}

fn new_span_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

fn parse_traceparent(raw: &str) -> Option<(String, String, u8)> {
    let parts: Vec<&str> = raw.trim().split('-').collect();
    if parts.len() != 4 {
        return None;
    }
    let trace_id = parts[1].to_string();
    let span_id = parts[2].to_string();
    let flags = u8::from_str_radix(parts[3], 16).ok()?;
    Some((trace_id, span_id, flags))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip_preserves_trace_and_correlation() {
        let root = RequestContext::new_root();
        let headers = root.to_headers();
        let parsed = RequestContext::from_headers(&headers);
        assert_eq!(parsed.trace_id, root.trace_id);
        assert_eq!(parsed.correlation_id, root.correlation_id);
    }

    #[test]
    fn child_keeps_trace_id_but_gets_fresh_span() {
        let root = RequestContext::new_root();
        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_ne!(child.span_id, root.span_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(root.span_id.as_str()));
    }
}
