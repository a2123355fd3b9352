//! `IntegrationLayer`: composition root for the integration core.

use super::circuit_breaker::CircuitBreaker;
use super::event_bus::{Broker, EventBus};
use super::models::CircuitBreakerConfig;
use super::observability::ObservabilityCollector;
use super::request_orchestrator::RequestOrchestrator;
use super::saga_orchestrator::SagaOrchestrator;
use super::service_registry::ServiceRegistry;
use crate::runtime::ports::EventSink;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Tunables an operator would set for the integration core, grouped by
/// owning component.
#[derive(Debug, Clone)]
pub struct IntegrationLayerConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub default_request_timeout: Duration,
    pub saga_base_delay: Duration,
    pub saga_max_delay: Duration,
    pub observability_output_file: Option<PathBuf>,
}

impl Default for IntegrationLayerConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            default_request_timeout: Duration::from_secs(10),
            saga_base_delay: Duration::from_millis(100),
            saga_max_delay: Duration::from_secs(30),
            observability_output_file: None,
        }
    }
}

/// Wires the L11 integration components together behind one entry point,
/// the way `AgentRuntime` wires the runtime core.
pub struct IntegrationLayer {
    pub registry: Arc<ServiceRegistry>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub event_bus: Arc<EventBus>,
    pub requests: Arc<RequestOrchestrator>,
    pub sagas: Arc<SagaOrchestrator>,
    pub observability: Arc<ObservabilityCollector>,
}

impl IntegrationLayer {
    /// Build the layer. `broker` is the pub/sub transport (`RedisBroker` in
    /// production, `InMemoryBroker` in tests) and `event_sink` is the same
    /// sink the runtime core emits lifecycle events through.
    pub fn new(
        config: IntegrationLayerConfig,
        broker: Arc<dyn Broker>,
        event_sink: Arc<dyn EventSink>,
    ) -> Result<Self, super::errors::IntegrationError> {
        let registry = Arc::new(ServiceRegistry::new(event_sink));
        let circuit_breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker)?);
        let event_bus = Arc::new(EventBus::new(broker));
        let requests = Arc::new(RequestOrchestrator::new(
            registry.clone(),
            circuit_breaker.clone(),
            config.default_request_timeout,
        ));
        let sagas = Arc::new(SagaOrchestrator::new(config.saga_base_delay, config.saga_max_delay));
        let observability = Arc::new(ObservabilityCollector::new(config.observability_output_file));

        Ok(Self { registry, circuit_breaker, event_bus, requests, sagas, observability })
    }

    /// Start the Redis subscriber loop and the periodic observability flush.
    /// No-op for the event bus when it was built over an in-memory broker
    /// (there is nothing to subscribe to).
    pub fn start_background_loops(&self, redis_url: Option<&str>) -> tokio::task::JoinHandle<()> {
        if let Some(url) = redis_url {
            if let Err(err) = self.event_bus.start_redis_listener(url.to_string()) {
                tracing::error!(%err, "integration layer failed to start event bus listener");
            }
        }
        self.observability.start()
    }

    pub async fn shutdown(&self) {
        self.registry.cleanup().await;
        self.event_bus.stop().await;
        self.observability.stop().await;
    }
}
