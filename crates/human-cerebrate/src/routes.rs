use crate::error::ApiError;
use crate::state::AppState;
use abathur::integration::{HealthCheckConfig, ServiceInfo};
use abathur::runtime::{AgentConfig, ResourceLimits, TrustLevel};
use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/agents", post(spawn_agent))
        .route("/agents/{agent_id}", get(get_agent).delete(terminate_agent))
        .route("/services", get(list_services).post(register_service))
        .route("/services/{service_name}/request", post(route_request))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct SpawnAgentRequest {
    agent_id: String,
    trust_level: TrustLevel,
    image: String,
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    environment: HashMap<String, String>,
    resource_limits: ResourceLimits,
    #[serde(default)]
    initial_context: Option<String>,
    #[serde(default)]
    requested_runtime_class: Option<String>,
}

async fn spawn_agent(
    State(state): State<AppState>,
    Json(req): Json<SpawnAgentRequest>,
) -> Result<Json<Value>, ApiError> {
    let config = AgentConfig {
        agent_id: req.agent_id,
        trust_level: req.trust_level,
        resource_limits: req.resource_limits,
        tools: req.tools,
        environment: req.environment,
        initial_context: req.initial_context.clone(),
        requested_runtime_class: req.requested_runtime_class,
        image: req.image,
        command: req.command,
    };

    let result = state
        .runtime
        .lifecycle
        .spawn(config, req.initial_context)
        .await
        .map_err(ApiError::runtime)?;

    Ok(Json(serde_json::to_value(result).unwrap_or(Value::Null)))
}

async fn get_agent(State(state): State<AppState>, Path(agent_id): Path<String>) -> Result<Json<Value>, ApiError> {
    let instance = state.runtime.lifecycle.get_instance(&agent_id).await.map_err(ApiError::runtime)?;
    Ok(Json(serde_json::to_value(instance).unwrap_or(Value::Null)))
}

async fn terminate_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .runtime
        .lifecycle
        .terminate(&agent_id, "requested via human-cerebrate", false)
        .await
        .map_err(ApiError::runtime)?;
    Ok(Json(json!({ "terminated": agent_id })))
}

async fn list_services(State(state): State<AppState>) -> Json<Value> {
    let services = state.integration.registry.list_services().await;
    Json(serde_json::to_value(services).unwrap_or(Value::Null))
}

#[derive(Debug, Deserialize)]
struct RegisterServiceRequest {
    service_name: String,
    endpoint: String,
    #[serde(default)]
    health_check: Option<HealthCheckConfig>,
}

async fn register_service(
    State(state): State<AppState>,
    Json(req): Json<RegisterServiceRequest>,
) -> Result<Json<Value>, ApiError> {
    let health_check = req.health_check.unwrap_or_default();
    let info = ServiceInfo::new(req.service_name, req.endpoint, health_check);
    let service_id = info.service_id.clone();
    state.integration.registry.register(info).await.map_err(ApiError::integration)?;
    Ok(Json(json!({ "service_id": service_id })))
}

#[derive(Debug, Deserialize)]
struct RouteRequestBody {
    #[serde(default)]
    method: String,
    path: String,
    #[serde(default)]
    body: Option<Value>,
}

#[derive(Debug, Serialize)]
struct RouteResponseBody {
    status: u16,
    body: Value,
}

async fn route_request(
    State(state): State<AppState>,
    Path(service_name): Path<String>,
    Json(req): Json<RouteRequestBody>,
) -> Result<Json<RouteResponseBody>, ApiError> {
    let method: reqwest::Method = req.method.parse().unwrap_or(reqwest::Method::GET);
    let response = state
        .integration
        .requests
        .route_request(&service_name, method, &req.path, req.body, None, None)
        .await
        .map_err(ApiError::integration)?;

    Ok(Json(RouteResponseBody { status: response.status, body: response.body }))
}

async fn metrics(State(state): State<AppState>) -> Json<Value> {
    let spans = state.integration.observability.recent_spans(100).await;
    Json(json!({ "recent_spans": spans }))
}
