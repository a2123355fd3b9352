//! Abathur process entry point: loads configuration, wires the agent
//! runtime core and the integration core together, and runs until
//! interrupted.

use abathur::infrastructure::config::ConfigLoader;
use abathur::infrastructure::logging::{LogConfig, LogFormat, LoggerImpl};
use abathur::integration::{InMemoryBroker, IntegrationLayer, IntegrationLayerConfig, RedisBroker};
use abathur::runtime::{
    AgentConfig, AgentRuntime, AgentRuntimeConfig, EventSink, InMemoryHotStateStore,
    LocalSandboxProvider, RedisHotStateStore, SqliteCheckpointStore,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Forwards runtime/integration state-change events to `tracing` as
/// structured events, standing in for an external event log subscriber.
struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event_type: &str, aggregate_id: &str, payload: Value) {
        tracing::info!(event_type, aggregate_id, %payload, "state change event");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ConfigLoader::load().context("failed to load configuration")?;

    let log_format = match config.logging.format.as_str() {
        "pretty" => LogFormat::Pretty,
        _ => LogFormat::Json,
    };
    let log_config = LogConfig {
        level: config.logging.level.clone(),
        format: log_format,
        retention_days: i64::from(config.logging.retention_days),
        ..Default::default()
    };
    let _logger = LoggerImpl::init(&log_config).context("failed to initialize logging")?;

    let event_sink: Arc<dyn EventSink> = Arc::new(TracingEventSink);

    let database_url = format!("sqlite:{}", config.database.path);
    let checkpoints = Arc::new(
        SqliteCheckpointStore::connect(&database_url, Default::default())
            .await
            .context("failed to open checkpoint store")?,
    );

    let hot_state: Arc<dyn abathur::runtime::HotStateStore> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisHotStateStore::connect(url)
                .await
                .context("failed to connect hot-state-store to redis")?,
        ),
        None => Arc::new(InMemoryHotStateStore::new()),
    };

    let sandbox_provider = Arc::new(LocalSandboxProvider::new());

    let runtime_config = AgentRuntimeConfig {
        available_runtime_classes: vec!["runc".to_string(), "gvisor".to_string(), "kata".to_string()],
        ..Default::default()
    };

    let warm_pool_template = AgentConfig {
        agent_id: "warm-pool-template".to_string(),
        trust_level: abathur::runtime::TrustLevel::Standard,
        resource_limits: abathur::runtime::ResourceLimits { cpu_cores: 1.0, memory_mb: 512, tokens_per_hour: 10_000 },
        tools: vec![],
        environment: HashMap::new(),
        initial_context: None,
        requested_runtime_class: None,
        image: "abathur/agent:latest".to_string(),
        command: vec![],
    };

    let runtime = AgentRuntime::new(
        runtime_config,
        sandbox_provider,
        event_sink.clone(),
        checkpoints.clone(),
        hot_state,
        None,
        warm_pool_template,
    );

    let integration_layer_config = IntegrationLayerConfig {
        circuit_breaker: config.circuit_breaker.clone().into(),
        ..Default::default()
    };

    let broker: Arc<dyn abathur::integration::Broker> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisBroker::connect(url)
                .await
                .context("failed to connect event bus to redis")?,
        ),
        None => Arc::new(InMemoryBroker::default()),
    };

    let integration = IntegrationLayer::new(integration_layer_config, broker, event_sink)
        .context("failed to build integration layer")?;

    let _runtime_background = runtime.start_background_loops();
    let _integration_background = integration.start_background_loops(config.redis_url.as_deref());

    tracing::info!("abathur runtime started");
    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");

    runtime.shutdown();
    integration.shutdown().await;

    Ok(())
}
