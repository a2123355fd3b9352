//! Per-service circuit breaker state machine.

use super::errors::{IntegrationError, IntegrationResult};
use super::models::{CircuitBreakerConfig, CircuitState};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct Window {
    start: DateTime<Utc>,
    total_requests: u64,
    failed_requests: u64,
}

impl Window {
    fn new() -> Self {
        Self { start: Utc::now(), total_requests: 0, failed_requests: 0 }
    }

    fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        }
    }
}

#[derive(Debug, Clone)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<DateTime<Utc>>,
    window: Window,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            window: Window::new(),
        }
    }
}

/// Tracks one state machine per downstream service name and enforces the
/// closed/open/half-open transitions exactly.
pub struct CircuitBreaker {
    circuits: Arc<RwLock<HashMap<String, Circuit>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> IntegrationResult<Self> {
        if config.failure_threshold == 0 || config.success_threshold == 0 {
            return Err(IntegrationError::InvalidCircuitConfig(
                "failure_threshold and success_threshold must be > 0".to_string(),
            ));
        }
        Ok(Self { circuits: Arc::new(RwLock::new(HashMap::new())), config })
    }

    /// `can_attempt_request`: lazily evaluates the Open -> HalfOpen timeout
    /// transition on read, rather than on a background timer.
    pub async fn can_attempt_request(&self, service: &str) -> bool {
        let mut circuits = self.circuits.write().await;
        let circuit = circuits.entry(service.to_string()).or_insert_with(Circuit::new);
        roll_window(circuit, &self.config);

        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = circuit.opened_at.map_or(0.0, |opened| (Utc::now() - opened).num_milliseconds() as f64 / 1000.0);
                if elapsed >= self.config.timeout_sec {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.consecutive_successes = 0;
                    info!(service, "circuit half-open, allowing trial request");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self, service: &str) {
        let mut circuits = self.circuits.write().await;
        let circuit = circuits.entry(service.to_string()).or_insert_with(Circuit::new);
        roll_window(circuit, &self.config);
        circuit.window.total_requests += 1;
        circuit.consecutive_failures = 0;

        match circuit.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                circuit.consecutive_successes += 1;
                if circuit.consecutive_successes >= self.config.success_threshold {
                    close(circuit, service);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self, service: &str) {
        let mut circuits = self.circuits.write().await;
        let circuit = circuits.entry(service.to_string()).or_insert_with(Circuit::new);
        roll_window(circuit, &self.config);
        circuit.window.total_requests += 1;
        circuit.window.failed_requests += 1;
        circuit.consecutive_successes = 0;
        circuit.consecutive_failures += 1;

        match circuit.state {
            CircuitState::Closed => {
                if circuit.consecutive_failures >= self.config.failure_threshold
                    || circuit.window.error_rate() >= self.config.error_rate_threshold
                {
                    open(circuit, service);
                }
            }
            CircuitState::HalfOpen => open(circuit, service),
            CircuitState::Open => {}
        }
    }

    pub async fn state(&self, service: &str) -> CircuitState {
        self.circuits.read().await.get(service).map_or(CircuitState::Closed, |c| c.state)
    }

    pub async fn reset(&self, service: &str) {
        self.circuits.write().await.insert(service.to_string(), Circuit::new());
    }

    /// Wrap an async call: denies without invoking `func` when the circuit
    /// is open, records success/failure on completion.
    pub async fn execute<F, Fut, T, E>(&self, service: &str, func: F) -> IntegrationResult<Result<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.can_attempt_request(service).await {
            return Err(IntegrationError::CircuitOpen(service.to_string()));
        }

        match func().await {
            Ok(value) => {
                self.record_success(service).await;
                Ok(Ok(value))
            }
            Err(err) => {
                self.record_failure(service).await;
                Ok(Err(err))
            }
        }
    }
}

fn roll_window(circuit: &mut Circuit, config: &CircuitBreakerConfig) {
    let elapsed = (Utc::now() - circuit.window.start).num_milliseconds() as f64 / 1000.0;
    if elapsed >= config.window_size_sec {
        circuit.window = Window::new();
    }
}

fn open(circuit: &mut Circuit, service: &str) {
    circuit.state = CircuitState::Open;
    circuit.opened_at = Some(Utc::now());
    circuit.consecutive_successes = 0;
    warn!(service, "circuit opened");
}

fn close(circuit: &mut Circuit, service: &str) {
    circuit.state = CircuitState::Closed;
    circuit.opened_at = None;
    circuit.consecutive_failures = 0;
    circuit.consecutive_successes = 0;
    circuit.window = Window::new();
    info!(service, "circuit closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failure_threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig { failure_threshold, success_threshold: 1, timeout_sec: 0.1, error_rate_threshold: 1.1, window_size_sec: 60.0 }
    }

    #[tokio::test]
    async fn opens_at_exactly_the_nth_consecutive_failure() {
        let cb = CircuitBreaker::new(config(3)).unwrap();
        for _ in 0..2 {
            cb.record_failure("svc").await;
            assert_eq!(cb.state("svc").await, CircuitState::Closed);
        }
        cb.record_failure("svc").await;
        assert_eq!(cb.state("svc").await, CircuitState::Open);
    }

    #[tokio::test]
    async fn open_denies_until_timeout_then_half_opens_and_closes() {
        let cb = CircuitBreaker::new(config(1)).unwrap();
        cb.record_failure("svc").await;
        assert!(!cb.can_attempt_request("svc").await);

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        assert!(cb.can_attempt_request("svc").await);
        assert_eq!(cb.state("svc").await, CircuitState::HalfOpen);

        cb.record_success("svc").await;
        assert_eq!(cb.state("svc").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new(config(1)).unwrap();
        cb.record_failure("svc").await;
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        assert!(cb.can_attempt_request("svc").await);
        cb.record_failure("svc").await;
        assert_eq!(cb.state("svc").await, CircuitState::Open);
    }

    #[tokio::test]
    async fn execute_denies_without_invoking_when_open() {
        let cb = CircuitBreaker::new(config(1)).unwrap();
        cb.record_failure("svc").await;
        let mut invoked = false;
        let result = cb.execute::<_, _, (), ()>("svc", || async {
            invoked = true;
            Ok(())
        }).await;
        assert!(!invoked);
        assert!(matches!(result, Err(IntegrationError::CircuitOpen(_))));
    }

    #[test]
    fn rejects_zero_thresholds() {
        let err = CircuitBreaker::new(config(0)).unwrap_err();
        assert!(matches!(err, IntegrationError::InvalidCircuitConfig(_)));
    }
}
