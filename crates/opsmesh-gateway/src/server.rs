use crate::handlers;
use axum::{
    routing::{get, post},
    Router,
};
use opsmesh_orchestrator::{Coordinator, PriorityQueueCalculator, QueueSettings};
use std::sync::Arc;

/// Shared application state.
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub queue: PriorityQueueCalculator,
}

/// The HTTP gateway.
pub struct GatewayServer;

impl GatewayServer {
    /// Builds the router over a running coordinator.
    pub fn build(coordinator: Arc<Coordinator>, queue: QueueSettings) -> Router {
        let state = Arc::new(AppState {
            coordinator,
            queue: PriorityQueueCalculator::new(queue),
        });

        Router::new()
            .route("/health", get(handlers::health))
            .route("/flows", get(handlers::list_flows))
            .route(
                "/flows/{id}",
                post(handlers::start_flow).get(handlers::get_flow),
            )
            .route("/flows/{id}/cancel", post(handlers::cancel_flow))
            .route(
                "/agents",
                get(handlers::list_agents).post(handlers::register_agent),
            )
            .route("/agents/stats", get(handlers::agent_stats))
            .route("/agents/{id}", axum::routing::delete(handlers::remove_agent))
            .route("/agents/{id}/heartbeat", post(handlers::heartbeat))
            .route("/responses", post(handlers::task_response))
            .route("/queue/estimate", post(handlers::queue_estimate))
            .with_state(state)
    }
}
