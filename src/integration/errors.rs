//! Error taxonomy for the integration core.

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
}

#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("service {0} already registered")]
    ServiceAlreadyRegistered(String),

    #[error("publish failed for topic {topic}: {message}")]
    PublishFailed { topic: String, message: String },

    #[error("event delivery timed out for topic {0}")]
    EventDeliveryTimeout(String),

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("invalid circuit breaker config: {0}")]
    InvalidCircuitConfig(String),

    #[error("request to {service} timed out after {elapsed_ms}ms")]
    RequestTimeout { service: String, elapsed_ms: u64 },

    #[error("request to {service} failed with status {status}: {message}")]
    RequestFailed { service: String, status: u16, message: String },

    #[error("saga not found: {0}")]
    SagaNotFound(String),

    #[error("invalid saga definition: {0}")]
    InvalidSagaDefinition(String),

    #[error("saga step failed: {step}: {message}")]
    StepFailed { step: String, message: String },

    #[error("saga timed out at step {0}")]
    SagaTimeout(String),

    #[error("compensation failed, first failure at step {step}: {message}")]
    CompensationFailed { step: String, message: String },

    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    #[error("shutdown failed: {0}")]
    ShutdownFailed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IntegrationError {
    /// Stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ServiceNotFound(_) => "E11001",
            Self::ServiceAlreadyRegistered(_) => "E11002",
            Self::PublishFailed { .. } => "E11101",
            Self::EventDeliveryTimeout(_) => "E11107",
            Self::CircuitOpen(_) => "E11201",
            Self::InvalidCircuitConfig(_) => "E11204",
            Self::RequestTimeout { .. } => "E11302",
            Self::RequestFailed { .. } => "E11303",
            Self::SagaNotFound(_) => "E11406",
            Self::InvalidSagaDefinition(_) => "E11404",
            Self::StepFailed { .. } => "E11401",
            Self::SagaTimeout(_) => "E11403",
            Self::CompensationFailed { .. } => "E11405",
            Self::InitializationFailed(_) => "E11903",
            Self::ShutdownFailed(_) => "E11904",
            Self::Serialization(_) => "E11999",
        }
    }

    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ServiceNotFound(_) | Self::SagaNotFound(_) => ErrorKind::NotFound,
            Self::ServiceAlreadyRegistered(_)
            | Self::InvalidCircuitConfig(_)
            | Self::InvalidSagaDefinition(_) => ErrorKind::InvalidInput,
            Self::RequestTimeout { .. } | Self::SagaTimeout(_) | Self::EventDeliveryTimeout(_) => {
                ErrorKind::Timeout
            }
            Self::PublishFailed { .. } | Self::CircuitOpen(_) | Self::StepFailed { .. } => {
                ErrorKind::Transient
            }
            Self::RequestFailed { .. } => ErrorKind::Unavailable,
            Self::CompensationFailed { .. }
            | Self::InitializationFailed(_)
            | Self::ShutdownFailed(_)
            | Self::Serialization(_) => ErrorKind::Fatal,
        }
    }
}

pub type IntegrationResult<T> = Result<T, IntegrationError>;
