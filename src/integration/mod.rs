//! Integration Core (Layer L11).
//!
//! The narrow interface between the agent runtime and the rest of the
//! platform: a service registry with active health probing, a circuit
//! breaker keyed per downstream service, a cross-service request
//! orchestrator that propagates trace context, a pub/sub event bus backed
//! by Redis with a dead-letter queue, a saga orchestrator for multi-step
//! compensating transactions, and an in-memory span/metric collector.

pub mod circuit_breaker;
pub mod errors;
pub mod event_bus;
pub mod facade;
pub mod models;
pub mod observability;
pub mod request_orchestrator;
pub mod saga_orchestrator;
pub mod service_registry;

pub use circuit_breaker::CircuitBreaker;
pub use errors::{ErrorKind, IntegrationError, IntegrationResult};
pub use event_bus::{Broker, EventBus, EventHandler, InMemoryBroker, RedisBroker};
pub use facade::{IntegrationLayer, IntegrationLayerConfig};
pub use models::{
    CircuitBreakerConfig, CircuitState, DeadLetterEntry, EventMessage, EventMetadata,
    EventPriority, HealthCheckConfig, ProbeKind, RequestContext, SagaExecution, SagaStatus,
    ServiceInfo, ServiceStatus, StepStatus, StepTrace,
};
pub use observability::{
    Counter, Gauge, Histogram, MetricSample, MetricSummary, ObservabilityCollector, SpanKind,
    SpanRecord, SpanStatus,
};
pub use request_orchestrator::{RequestOrchestrator, ServiceResponse};
pub use saga_orchestrator::{
    CompensationAction, SagaAction, SagaDefinition, SagaOrchestrator, SagaStep,
};
pub use service_registry::ServiceRegistry;
