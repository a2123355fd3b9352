use abathur::integration::IntegrationLayer;
use abathur::runtime::AgentRuntime;
use std::sync::Arc;

/// Shared handles into the two cores this shell exposes over HTTP. No
/// business logic lives here beyond holding the `Arc`s.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<AgentRuntime>,
    pub integration: Arc<IntegrationLayer>,
}
