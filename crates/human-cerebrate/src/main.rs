//! Thin Axum HTTP shell over the agent runtime and integration cores.
//! Handlers call straight into `AgentRuntime`/`IntegrationLayer`; this
//! binary carries no business logic of its own.

mod error;
mod routes;
mod state;

use abathur::infrastructure::config::ConfigLoader;
use abathur::infrastructure::logging::{LogConfig, LogFormat, LoggerImpl};
use abathur::integration::{InMemoryBroker, IntegrationLayer, IntegrationLayerConfig, RedisBroker};
use abathur::runtime::{
    AgentConfig, AgentRuntime, AgentRuntimeConfig, EventSink, InMemoryHotStateStore,
    LocalSandboxProvider, RedisHotStateStore, SqliteCheckpointStore,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use serde_json::Value;
use state::AppState;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, env = "HUMAN_CEREBRATE_BIND", default_value = "0.0.0.0:8080")]
    bind: String,
}

struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event_type: &str, aggregate_id: &str, payload: Value) {
        tracing::info!(event_type, aggregate_id, %payload, "state change event");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
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
        Some(url) => {
            Arc::new(RedisHotStateStore::connect(url).await.context("failed to connect hot-state-store")?)
        }
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

    let runtime = Arc::new(AgentRuntime::new(
        runtime_config,
        sandbox_provider,
        event_sink.clone(),
        checkpoints,
        hot_state,
        None,
        warm_pool_template,
    ));

    let integration_layer_config = IntegrationLayerConfig {
        circuit_breaker: config.circuit_breaker.clone().into(),
        ..Default::default()
    };

    let broker: Arc<dyn abathur::integration::Broker> = match &config.redis_url {
        Some(url) => Arc::new(RedisBroker::connect(url).await.context("failed to connect event bus")?),
        None => Arc::new(InMemoryBroker::default()),
    };

    let integration =
        Arc::new(IntegrationLayer::new(integration_layer_config, broker, event_sink).context("failed to build integration layer")?);

    let _runtime_background = runtime.start_background_loops();
    let _integration_background = integration.start_background_loops(config.redis_url.as_deref());

    let app = routes::router(AppState { runtime: runtime.clone(), integration: integration.clone() });
    let listener = tokio::net::TcpListener::bind(&args.bind).await.context("failed to bind listener")?;
    tracing::info!(bind = %args.bind, "human-cerebrate listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("http server error")?;

    runtime.shutdown();
    integration.shutdown().await;

    Ok(())
}
