//! Cross-service RPC with trace-context propagation.

use super::circuit_breaker::CircuitBreaker;
use super::errors::{IntegrationError, IntegrationResult};
use super::models::RequestContext;
use super::service_registry::ServiceRegistry;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ServiceResponse {
    pub status: u16,
    pub body: Value,
}

pub struct RequestOrchestrator {
    registry: Arc<ServiceRegistry>,
    breaker: Arc<CircuitBreaker>,
    http: reqwest::Client,
    default_timeout: Duration,
}

impl RequestOrchestrator {
    pub fn new(registry: Arc<ServiceRegistry>, breaker: Arc<CircuitBreaker>, default_timeout: Duration) -> Self {
        Self {
            registry,
            breaker,
            http: reqwest::Client::builder().build().expect("reqwest client"),
            default_timeout,
        }
    }

    /// `route_request`: resolve the target, propagate trace context,
    /// execute through the breaker, map timeout vs HTTP errors distinctly.
    pub async fn route_request(
        &self,
        service_name: &str,
        method: reqwest::Method,
        path: &str,
        data: Option<Value>,
        ctx: Option<RequestContext>,
        timeout: Option<Duration>,
    ) -> IntegrationResult<ServiceResponse> {
        let ctx = ctx.unwrap_or_else(RequestContext::new_root);
        info!(service_name, method = %method, path, trace_id = %ctx.trace_id, "opening client span");

        let service = match self.registry.get_service_by_name(service_name).await {
            Some(service) => service,
            None => return Err(IntegrationError::ServiceNotFound(service_name.to_string())),
        };
        if service.status != super::models::ServiceStatus::Healthy {
            warn!(service_name, ?service.status, "routing to non-healthy service instance");
        }

        let url = format!("{}{}", service.endpoint.trim_end_matches('/'), path);
        let headers = ctx.to_headers();
        let timeout = timeout.unwrap_or(self.default_timeout);

        let outcome = self
            .breaker
            .execute(service_name, || async {
                let mut request = self.http.request(method.clone(), &url).timeout(timeout);
                for (k, v) in &headers {
                    request = request.header(k.as_str(), v.as_str());
                }
                if let Some(body) = &data {
                    request = request.json(body);
                }
                request.send().await
            })
            .await?;

        let response = match outcome {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                return Err(IntegrationError::RequestTimeout { service: service_name.to_string(), elapsed_ms: timeout.as_millis() as u64 });
            }
            Err(err) => {
                return Err(IntegrationError::RequestFailed { service: service_name.to_string(), status: 0, message: err.to_string() });
            }
        };

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(IntegrationError::RequestFailed { service: service_name.to_string(), status: status.as_u16(), message });
        }

        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(ServiceResponse { status: status.as_u16(), body })
    }

    /// Fan out to several services concurrently, each with a fresh child
    /// trace context.
    pub async fn broadcast_request(
        &self,
        service_names: &[String],
        method: reqwest::Method,
        path: &str,
        data: Option<Value>,
        ctx: Option<RequestContext>,
    ) -> HashMap<String, IntegrationResult<ServiceResponse>> {
        let ctx = ctx.unwrap_or_else(RequestContext::new_root);
        let futures = service_names.iter().map(|name| {
            let child_ctx = ctx.child();
            let data = data.clone();
            let method = method.clone();
            async move {
                let result = self.route_request(name, method, path, data, Some(child_ctx), None).await;
                (name.clone(), result)
            }
        });
        futures::future::join_all(futures).await.into_iter().collect()
    }

    /// Keep only successful responses by default; callers may supply a
    /// different reducer.
    pub fn aggregate_responses(
        results: HashMap<String, IntegrationResult<ServiceResponse>>,
    ) -> HashMap<String, ServiceResponse> {
        results.into_iter().filter_map(|(name, result)| result.ok().map(|r| (name, r))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::models::{CircuitBreakerConfig, HealthCheckConfig, ServiceInfo};
    use crate::runtime::ports::EventSink;
    use async_trait::async_trait;

    struct NullSink;
    #[async_trait]
    impl EventSink for NullSink {
        async fn emit(&self, _event_type: &str, _aggregate_id: &str, _payload: Value) {}
    }

    #[tokio::test]
    async fn route_request_errors_when_service_unregistered() {
        let registry = Arc::new(ServiceRegistry::new(Arc::new(NullSink)));
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()).unwrap());
        let orchestrator = RequestOrchestrator::new(registry, breaker, Duration::from_secs(1));

        let err = orchestrator
            .route_request("missing", reqwest::Method::GET, "/x", None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, IntegrationError::ServiceNotFound(_)));
    }

    #[tokio::test]
    async fn aggregate_responses_keeps_only_successes() {
        let mut results: HashMap<String, IntegrationResult<ServiceResponse>> = HashMap::new();
        results.insert("a".to_string(), Ok(ServiceResponse { status: 200, body: Value::Null }));
        results.insert("b".to_string(), Err(IntegrationError::ServiceNotFound("b".to_string())));

        let aggregated = RequestOrchestrator::aggregate_responses(results);
        assert_eq!(aggregated.len(), 1);
        assert!(aggregated.contains_key("a"));
    }

    #[tokio::test]
    async fn registered_unhealthy_service_still_resolves() {
        let registry = Arc::new(ServiceRegistry::new(Arc::new(NullSink)));
        registry
            .register(ServiceInfo::new("svc", "http://127.0.0.1:9", HealthCheckConfig::default()))
            .await
            .unwrap();
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()).unwrap());
        let orchestrator = RequestOrchestrator::new(registry.clone(), breaker, Duration::from_millis(50));

        // Connection refused (nothing listening), not a service-not-found error.
        let err = orchestrator
            .route_request("svc", reqwest::Method::GET, "/x", None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, IntegrationError::RequestFailed { .. } | IntegrationError::RequestTimeout { .. }));
        registry.cleanup().await;
    }
}
