//! Abathur - agent runtime and integration fabric for a multi-layer AI platform.
//!
//! Two peer cores, connected by a narrow interface:
//! - [`runtime`]: the Agent Runtime Core (L02) — sandbox policy, lifecycle
//!   state machine, checkpoint/restore, resource quotas, graceful drain,
//!   warm-instance pool, workflow graph execution, multi-role handoff.
//! - [`integration`]: the Integration Core (L11) — service registry, pub/sub
//!   event bus with a dead-letter queue, per-service circuit breakers,
//!   cross-service request orchestration, and saga compensation.
//!
//! [`infrastructure`] carries the ambient concerns both cores lean on:
//! the SQLite connection pool, structured logging, and the layered
//! config loader.

pub mod infrastructure;
pub mod integration;
pub mod runtime;

// Re-export key types for convenience
pub use infrastructure::database::DatabaseConnection;
pub use integration::IntegrationLayer;
pub use runtime::AgentRuntime;
