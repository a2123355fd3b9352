//! Resource quota tracking and enforcement.

use super::errors::{RuntimeError, RuntimeResult};
use super::models::{EnforcementAction, EnforcementMode, QuotaScope, ResourceLimits, ResourceQuota, ResourceUsage};
use super::ports::QuotaEnforcementSink;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Parse a CPU quantity string: `"N"` cores or `"Nm"` millicores.
pub fn parse_cpu(input: &str) -> RuntimeResult<f64> {
    let trimmed = input.trim();
    if let Some(digits) = trimmed.strip_suffix('m') {
        let millicores: f64 = digits
            .parse()
            .map_err(|_| RuntimeError::QuotaInvalid(format!("invalid cpu quantity: {input}")))?;
        Ok(millicores / 1000.0)
    } else {
        trimmed
            .parse()
            .map_err(|_| RuntimeError::QuotaInvalid(format!("invalid cpu quantity: {input}")))
    }
}

/// Parse a memory quantity string: `Gi` -> x1024 MiB, `Mi` -> x1, `G` -> x1000, `M` -> x1.
pub fn parse_memory_mb(input: &str) -> RuntimeResult<u64> {
    let trimmed = input.trim();
    let parse_num = |digits: &str| -> RuntimeResult<u64> {
        digits
            .parse()
            .map_err(|_| RuntimeError::QuotaInvalid(format!("invalid memory quantity: {input}")))
    };
    if let Some(digits) = trimmed.strip_suffix("Gi") {
        Ok(parse_num(digits)? * 1024)
    } else if let Some(digits) = trimmed.strip_suffix("Mi") {
        parse_num(digits)
    } else if let Some(digits) = trimmed.strip_suffix('G') {
        Ok(parse_num(digits)? * 1000)
    } else if let Some(digits) = trimmed.strip_suffix('M') {
        parse_num(digits)
    } else {
        Err(RuntimeError::QuotaInvalid(format!("invalid memory quantity: {input}")))
    }
}

/// Configuration knobs for resource enforcement.
#[derive(Debug, Clone)]
pub struct ResourceManagerConfig {
    pub cpu_enforcement: EnforcementMode,
    pub memory_enforcement: EnforcementMode,
    pub token_enforcement: EnforcementMode,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            cpu_enforcement: EnforcementMode::WarnOnly,
            memory_enforcement: EnforcementMode::SoftThenHard,
            token_enforcement: EnforcementMode::Hard,
        }
    }
}

fn scope_key(scope: &QuotaScope) -> String {
    match scope {
        QuotaScope::Agent(id) | QuotaScope::Tenant(id) | QuotaScope::Namespace(id) => id.clone(),
    }
}

pub struct ResourceManager {
    config: ResourceManagerConfig,
    quotas: Arc<RwLock<HashMap<String, ResourceQuota>>>,
    sink: Arc<dyn QuotaEnforcementSink>,
}

impl ResourceManager {
    pub fn new(config: ResourceManagerConfig, sink: Arc<dyn QuotaEnforcementSink>) -> Self {
        Self { config, quotas: Arc::new(RwLock::new(HashMap::new())), sink }
    }

    pub async fn create_quota(&self, scope: QuotaScope, limits: ResourceLimits) -> RuntimeResult<()> {
        limits.validate().map_err(RuntimeError::QuotaInvalid)?;
        let quota = ResourceQuota {
            scope: scope.clone(),
            limits,
            usage: ResourceUsage::default(),
            reset_at: Utc::now() + Duration::hours(1),
            cpu_enforcement: self.config.cpu_enforcement,
            memory_enforcement: self.config.memory_enforcement,
            token_enforcement: self.config.token_enforcement,
            warned_cpu: false,
            warned_memory: false,
            warned_tokens: false,
        };
        self.quotas.write().await.insert(scope_key(&scope), quota);
        Ok(())
    }

    /// Report usage deltas/peaks and trigger enforcement if the quota is breached.
    pub async fn report_usage(
        &self,
        agent_id: &str,
        cpu_seconds_delta: Option<f64>,
        memory_mb_peak: Option<u64>,
        tokens_delta: Option<u64>,
    ) -> RuntimeResult<()> {
        let mut quotas = self.quotas.write().await;
        let quota = quotas
            .get_mut(agent_id)
            .ok_or_else(|| RuntimeError::QuotaInvalid(format!("no quota for {agent_id}")))?;

        if Utc::now() >= quota.reset_at {
            quota.usage = ResourceUsage::default();
            quota.reset_at = Utc::now() + Duration::hours(1);
            quota.warned_cpu = false;
            quota.warned_memory = false;
            quota.warned_tokens = false;
        }

        if let Some(delta) = cpu_seconds_delta {
            quota.usage.cpu_seconds += delta;
        }
        if let Some(peak) = memory_mb_peak {
            quota.usage.memory_peak_mb = quota.usage.memory_peak_mb.max(peak);
        }
        if let Some(delta) = tokens_delta {
            quota.usage.tokens_consumed += delta;
        }

        let cpu_breached = quota.usage.cpu_seconds > quota.limits.cpu_cores * 3600.0;
        let mem_breached = quota.usage.memory_peak_mb > quota.limits.memory_mb;
        let tokens_breached = quota.usage.tokens_consumed > quota.limits.tokens_per_hour;

        let mut signals: Vec<(&'static str, EnforcementAction)> = Vec::new();
        if cpu_breached {
            if let Some(action) = Self::decide(quota.cpu_enforcement, &mut quota.warned_cpu) {
                signals.push(("cpu", action));
            }
        }
        if mem_breached {
            if let Some(action) = Self::decide(quota.memory_enforcement, &mut quota.warned_memory) {
                signals.push(("memory", action));
            }
        }
        if tokens_breached {
            if let Some(action) = Self::decide(quota.token_enforcement, &mut quota.warned_tokens) {
                signals.push(("tokens", action));
            }
        }
        drop(quotas);

        for (resource, action) in signals {
            let reason = format!("{resource} quota breached for {agent_id}");
            match action {
                EnforcementAction::Warn => warn!(agent_id, resource, "quota warning"),
                _ => info!(agent_id, resource, ?action, "quota enforcement"),
            }
            self.sink.enforce(agent_id, action, &reason).await;
        }
        Ok(())
    }

    /// Decide the enforcement action for one resource kind given its mode
    /// and whether it has already warned once this window (SoftThenHard).
    fn decide(mode: EnforcementMode, warned: &mut bool) -> Option<EnforcementAction> {
        match mode {
            EnforcementMode::WarnOnly => Some(EnforcementAction::Warn),
            EnforcementMode::Hard => Some(EnforcementAction::Suspend),
            EnforcementMode::SoftThenHard => {
                if *warned {
                    Some(EnforcementAction::Suspend)
                } else {
                    *warned = true;
                    Some(EnforcementAction::Warn)
                }
            }
        }
    }

    pub async fn get_usage(&self, agent_id: &str) -> Option<ResourceUsage> {
        self.quotas.read().await.get(agent_id).map(|q| q.usage)
    }

    pub async fn reset_quota(&self, agent_id: &str) {
        if let Some(quota) = self.quotas.write().await.get_mut(agent_id) {
            quota.usage = ResourceUsage::default();
            quota.reset_at = Utc::now() + Duration::hours(1);
            quota.warned_cpu = false;
            quota.warned_memory = false;
            quota.warned_tokens = false;
        }
    }

    pub async fn cleanup_quota(&self, agent_id: &str) {
        self.quotas.write().await.remove(agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;
    #[async_trait::async_trait]
    impl QuotaEnforcementSink for NullSink {
        async fn enforce(&self, _agent_id: &str, _action: EnforcementAction, _reason: &str) {}
    }

    struct RecordingSink(Arc<RwLock<Vec<EnforcementAction>>>);
    #[async_trait::async_trait]
    impl QuotaEnforcementSink for RecordingSink {
        async fn enforce(&self, _agent_id: &str, action: EnforcementAction, _reason: &str) {
            self.0.write().await.push(action);
        }
    }

    #[test]
    fn cpu_parsing() {
        assert_eq!(parse_cpu("500m").unwrap(), 0.5);
        assert_eq!(parse_cpu("2").unwrap(), 2.0);
    }

    #[test]
    fn memory_parsing() {
        assert_eq!(parse_memory_mb("1Gi").unwrap(), 1024);
        assert_eq!(parse_memory_mb("1G").unwrap(), 1000);
        assert_eq!(parse_memory_mb("512Mi").unwrap(), 512);
        assert_eq!(parse_memory_mb("512M").unwrap(), 512);
    }

    #[test]
    fn memory_parsing_rejects_garbage() {
        assert!(parse_memory_mb("lots").is_err());
    }

    #[tokio::test]
    async fn token_breach_hard_enforcement_suspends() {
        let recorded = Arc::new(RwLock::new(Vec::new()));
        let sink = Arc::new(RecordingSink(recorded.clone()));
        let mgr = ResourceManager::new(ResourceManagerConfig::default(), sink);
        mgr.create_quota(
            QuotaScope::Agent("a2".into()),
            ResourceLimits { cpu_cores: 1.0, memory_mb: 100, tokens_per_hour: 100 },
        )
        .await
        .unwrap();

        mgr.report_usage("a2", None, None, Some(101)).await.unwrap();

        let actions = recorded.read().await;
        assert_eq!(actions.as_slice(), &[EnforcementAction::Suspend]);
    }

    #[tokio::test]
    async fn soft_then_hard_warns_then_suspends() {
        let recorded = Arc::new(RwLock::new(Vec::new()));
        let sink = Arc::new(RecordingSink(recorded.clone()));
        let mut config = ResourceManagerConfig::default();
        config.memory_enforcement = EnforcementMode::SoftThenHard;
        let mgr = ResourceManager::new(config, sink);
        mgr.create_quota(
            QuotaScope::Agent("a3".into()),
            ResourceLimits { cpu_cores: 1.0, memory_mb: 100, tokens_per_hour: 100_000 },
        )
        .await
        .unwrap();

        mgr.report_usage("a3", None, Some(200), None).await.unwrap();
        mgr.report_usage("a3", None, Some(300), None).await.unwrap();

        let actions = recorded.read().await;
        assert_eq!(actions.as_slice(), &[EnforcementAction::Warn, EnforcementAction::Suspend]);
    }

    #[tokio::test]
    async fn usage_tracking_is_monotonic_peak() {
        let mgr = ResourceManager::new(ResourceManagerConfig::default(), Arc::new(NullSink));
        mgr.create_quota(
            QuotaScope::Agent("a1".into()),
            ResourceLimits { cpu_cores: 1.0, memory_mb: 1024, tokens_per_hour: 10_000 },
        )
        .await
        .unwrap();
        mgr.report_usage("a1", None, Some(500), None).await.unwrap();
        mgr.report_usage("a1", None, Some(300), None).await.unwrap();
        let usage = mgr.get_usage("a1").await.unwrap();
        assert_eq!(usage.memory_peak_mb, 500);
    }
}
