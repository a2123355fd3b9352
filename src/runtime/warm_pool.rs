//! Pre-spawned `Suspended` instance pool.

use super::lifecycle_manager::LifecycleManager;
use super::models::{AgentConfig, AgentInstance};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct WarmPoolConfig {
    pub target_size: usize,
    pub max_instance_age: Duration,
    pub replenish_interval: Duration,
    pub template: AgentConfig,
}

/// Background-maintained pool of pre-spawned `Suspended` agents so
/// `FleetManager` can hand out an instance without paying cold-spawn
/// latency on the request path.
pub struct WarmPool {
    config: WarmPoolConfig,
    lifecycle: Arc<LifecycleManager>,
    pool: RwLock<VecDeque<AgentInstance>>,
    misses: AtomicU64,
    cancel: CancellationToken,
}

impl WarmPool {
    pub fn new(config: WarmPoolConfig, lifecycle: Arc<LifecycleManager>) -> Self {
        Self { config, lifecycle, pool: RwLock::new(VecDeque::new()), misses: AtomicU64::new(0), cancel: CancellationToken::new() }
    }

    /// Pop the oldest warm instance. Returns `None` on a miss (caller falls
    /// back to a cold `LifecycleManager::spawn`). An instance that aged out
    /// past `max_instance_age` is terminated rather than handed out.
    pub async fn allocate(&self) -> Option<AgentInstance> {
        loop {
            let candidate = self.pool.write().await.pop_front();
            match candidate {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(instance) => {
                    let age = Utc::now().signed_duration_since(instance.created_at);
                    let max_age = chrono::Duration::from_std(self.config.max_instance_age).unwrap_or_default();
                    if age > max_age {
                        let _ = self.lifecycle.terminate(&instance.agent_id, "warm pool aged out", true).await;
                        continue;
                    }
                    return Some(instance);
                }
            }
        }
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    async fn spawn_one(&self) -> Option<AgentInstance> {
        let mut config = self.config.template.clone();
        config.agent_id = format!("warm-{}", uuid::Uuid::new_v4());
        match self.lifecycle.spawn(config.clone(), None).await {
            Ok(_) => match self.lifecycle.suspend(&config.agent_id, false).await {
                Ok(_) => self.lifecycle.get_instance(&config.agent_id).await.ok(),
                Err(err) => {
                    warn!(%err, "failed to suspend newly-spawned warm instance");
                    None
                }
            },
            Err(err) => {
                warn!(%err, "failed to cold-spawn warm pool instance");
                None
            }
        }
    }

    /// Evict stale instances from the pool. Intended to run on a loop.
    pub async fn refresh_once(&self) {
        let mut pool = self.pool.write().await;
        let max_age = chrono::Duration::from_std(self.config.max_instance_age).unwrap_or_default();
        let mut keep = VecDeque::with_capacity(pool.len());
        while let Some(instance) = pool.pop_front() {
            let age = Utc::now().signed_duration_since(instance.created_at);
            if age > max_age {
                let lifecycle = self.lifecycle.clone();
                let agent_id = instance.agent_id.clone();
                tokio::spawn(async move {
                    let _ = lifecycle.terminate(&agent_id, "warm pool refresh eviction", true).await;
                });
            } else {
                keep.push_back(instance);
            }
        }
        *pool = keep;
    }

    /// Top the pool up to `target_size`. Intended to run on a 30s cadence.
    pub async fn replenish_once(&self) {
        let deficit = {
            let pool = self.pool.read().await;
            self.config.target_size.saturating_sub(pool.len())
        };
        for _ in 0..deficit {
            if let Some(instance) = self.spawn_one().await {
                self.pool.write().await.push_back(instance);
            }
        }
    }

    /// Spawn the refresh and replenish background loops. Returns a join
    /// handle pair the caller should hold to keep the tasks alive.
    pub fn start(self: &Arc<Self>) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let refresh_pool = self.clone();
        let refresh_cancel = self.cancel.clone();
        let refresh = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            loop {
                tokio::select! {
                    _ = refresh_cancel.cancelled() => break,
                    _ = ticker.tick() => refresh_pool.refresh_once().await,
                }
            }
        });

        let replenish_pool = self.clone();
        let replenish_cancel = self.cancel.clone();
        let replenish_interval = self.config.replenish_interval;
        let replenish = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(replenish_interval);
            loop {
                tokio::select! {
                    _ = replenish_cancel.cancelled() => break,
                    _ = ticker.tick() => replenish_pool.replenish_once().await,
                }
            }
        });

        info!(target_size = self.config.target_size, "warm pool background loops started");
        (refresh, replenish)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::errors::RuntimeResult;
    use crate::runtime::lifecycle_manager::LifecycleConfig;
    use crate::runtime::models::{ContainerState, ResourceLimits, SandboxConfiguration, TrustLevel};
    use crate::runtime::ports::{EventSink, SandboxProvider};
    use crate::runtime::sandbox_manager::SandboxManager;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashMap;

    struct FakeProvider;
    #[async_trait]
    impl SandboxProvider for FakeProvider {
        async fn spawn(&self, _c: &AgentConfig, _s: &SandboxConfiguration, _e: &HashMap<String, String>) -> RuntimeResult<String> {
            Ok(uuid::Uuid::new_v4().to_string())
        }
        async fn stop(&self, _h: &str, _t: Duration) -> RuntimeResult<()> {
            Ok(())
        }
        async fn kill(&self, _h: &str) -> RuntimeResult<()> {
            Ok(())
        }
        async fn checkpoint(&self, _h: &str) -> RuntimeResult<String> {
            Ok("cp".to_string())
        }
        async fn restore(&self, _h: &str, _c: &str) -> RuntimeResult<()> {
            Ok(())
        }
        async fn state(&self, _h: &str) -> RuntimeResult<ContainerState> {
            Ok(ContainerState::Running)
        }
    }

    struct NullSink;
    #[async_trait]
    impl EventSink for NullSink {
        async fn emit(&self, _t: &str, _a: &str, _p: Value) {}
    }

    fn template() -> AgentConfig {
        AgentConfig {
            agent_id: "template".to_string(),
            trust_level: TrustLevel::Standard,
            resource_limits: ResourceLimits { cpu_cores: 1.0, memory_mb: 512, tokens_per_hour: 10_000 },
            tools: vec![],
            environment: HashMap::new(),
            initial_context: None,
            requested_runtime_class: None,
            image: "img".to_string(),
            command: vec![],
        }
    }

    fn lifecycle() -> Arc<LifecycleManager> {
        Arc::new(LifecycleManager::new(
            LifecycleConfig::default(),
            SandboxManager::new(vec!["gvisor".into()]),
            Arc::new(FakeProvider),
            Arc::new(NullSink),
        ))
    }

    #[tokio::test]
    async fn allocate_on_empty_pool_is_a_miss() {
        let pool = WarmPool::new(
            WarmPoolConfig { target_size: 2, max_instance_age: Duration::from_secs(3600), replenish_interval: Duration::from_secs(30), template: template() },
            lifecycle(),
        );
        assert!(pool.allocate().await.is_none());
        assert_eq!(pool.miss_count(), 1);
    }

    #[tokio::test]
    async fn replenish_fills_to_target_and_allocate_hits() {
        let pool = WarmPool::new(
            WarmPoolConfig { target_size: 2, max_instance_age: Duration::from_secs(3600), replenish_interval: Duration::from_secs(30), template: template() },
            lifecycle(),
        );
        pool.replenish_once().await;
        let instance = pool.allocate().await;
        assert!(instance.is_some());
    }
}
