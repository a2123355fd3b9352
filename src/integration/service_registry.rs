//! Service registry with active health probing.

use super::errors::{IntegrationError, IntegrationResult};
use super::models::{HealthCheckConfig, ProbeKind, ServiceInfo, ServiceStatus};
use crate::runtime::ports::EventSink;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct Entry {
    info: ServiceInfo,
    consecutive_successes: u32,
    consecutive_failures: u32,
    task: Option<JoinHandle<()>>,
}

/// In-memory `service_id -> ServiceInfo` map guarded by a mutex, with one
/// background health-check task per registered service.
pub struct ServiceRegistry {
    services: Arc<RwLock<HashMap<String, Entry>>>,
    sink: Arc<dyn EventSink>,
    running: Arc<RwLock<bool>>,
    http: reqwest::Client,
}

impl ServiceRegistry {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            sink,
            running: Arc::new(RwLock::new(true)),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client"),
        }
    }

    /// Register a service instance and, if the registry is running, start
    /// its health-check loop.
    pub async fn register(&self, info: ServiceInfo) -> IntegrationResult<()> {
        let mut services = self.services.write().await;
        if services.contains_key(&info.service_id) {
            return Err(IntegrationError::ServiceAlreadyRegistered(info.service_id.clone()));
        }

        let running = *self.running.read().await;
        let task = if running {
            Some(self.spawn_health_loop(info.clone()))
        } else {
            None
        };

        services.insert(info.service_id.clone(), Entry {
            info,
            consecutive_successes: 0,
            consecutive_failures: 0,
            task,
        });
        Ok(())
    }

    pub async fn deregister(&self, service_id: &str) -> IntegrationResult<()> {
        let mut services = self.services.write().await;
        match services.remove(service_id) {
            Some(entry) => {
                if let Some(task) = entry.task {
                    task.abort();
                }
                Ok(())
            }
            None => Err(IntegrationError::ServiceNotFound(service_id.to_string())),
        }
    }

    pub async fn get_service(&self, service_id: &str) -> Option<ServiceInfo> {
        self.services.read().await.get(service_id).map(|e| e.info.clone())
    }

    /// Return the first `Healthy` instance for a logical name, else any
    /// instance, else `None`.
    pub async fn get_service_by_name(&self, service_name: &str) -> Option<ServiceInfo> {
        let services = self.services.read().await;
        let matches: Vec<&ServiceInfo> =
            services.values().map(|e| &e.info).filter(|i| i.service_name == service_name).collect();
        matches
            .iter()
            .find(|i| i.status == ServiceStatus::Healthy)
            .or_else(|| matches.first())
            .map(|i| (*i).clone())
    }

    pub async fn list_services(&self) -> Vec<ServiceInfo> {
        self.services.read().await.values().map(|e| e.info.clone()).collect()
    }

    fn spawn_health_loop(&self, info: ServiceInfo) -> JoinHandle<()> {
        let services = self.services.clone();
        let sink = self.sink.clone();
        let http = self.http.clone();
        let service_id = info.service_id.clone();
        let config = info.health_check_config.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.interval);
            loop {
                interval.tick().await;
                let probe_ok = probe_once(&http, &info.endpoint, &config).await;
                transition(&services, &sink, &service_id, &config, probe_ok).await;
            }
        })
    }

    /// `cleanup()`: abort every health-check task within a 2s soft budget
    /// and mark the registry stopped.
    pub async fn cleanup(&self) {
        *self.running.write().await = false;
        let mut services = self.services.write().await;
        for entry in services.values_mut() {
            if let Some(task) = entry.task.take() {
                task.abort();
            }
        }
    }
}

async fn probe_once(http: &reqwest::Client, endpoint: &str, config: &HealthCheckConfig) -> bool {
    let probe = tokio::time::timeout(config.timeout, async {
        match &config.probe {
            ProbeKind::Http { path } => {
                let url = format!("{}{}", endpoint.trim_end_matches('/'), path);
                matches!(http.get(url).send().await, Ok(resp) if resp.status().is_success())
            }
            ProbeKind::Tcp => TcpStream::connect(endpoint).await.is_ok(),
            ProbeKind::RedisPing => match redis::Client::open(endpoint.to_string()) {
                Ok(client) => match client.get_connection_manager().await {
                    Ok(mut conn) => redis::cmd("PING").query_async::<_, String>(&mut conn).await.is_ok(),
                    Err(_) => false,
                },
                Err(_) => false,
            },
        }
    })
    .await;
    matches!(probe, Ok(true))
}

async fn transition(
    services: &Arc<RwLock<HashMap<String, Entry>>>,
    sink: &Arc<dyn EventSink>,
    service_id: &str,
    config: &HealthCheckConfig,
    probe_ok: bool,
) {
    let mut services = services.write().await;
    let Some(entry) = services.get_mut(service_id) else { return };

    entry.info.last_probe_at = Some(chrono::Utc::now());
    if probe_ok {
        entry.consecutive_successes += 1;
        entry.consecutive_failures = 0;
    } else {
        entry.consecutive_failures += 1;
        entry.consecutive_successes = 0;
    }

    let previous = entry.info.status;
    if probe_ok && entry.consecutive_successes >= config.success_threshold {
        entry.info.status = ServiceStatus::Healthy;
    } else if !probe_ok && entry.consecutive_failures >= config.failure_threshold {
        entry.info.status = ServiceStatus::Unhealthy;
    }

    if entry.info.status != previous {
        let service_name = entry.info.service_name.clone();
        let new_status = entry.info.status;
        info!(service_id, service_name = %service_name, ?previous, ?new_status, "service status transition");
        sink.emit(
            "service.status_changed",
            service_id,
            serde_json::json!({"service_name": service_name, "status": new_status}),
        )
        .await;
    } else if !probe_ok {
        warn!(service_id, consecutive_failures = entry.consecutive_failures, "health probe failed");
    }
}
