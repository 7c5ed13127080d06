//! API route definitions

use crate::registry::Registry;
use crate::router::Router as RequestRouter;
use crate::state::StateManager;
use crate::supervisor::Supervisor;
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub supervisor: Arc<Supervisor>,
    pub router: Arc<RequestRouter>,
    pub state_manager: Arc<StateManager>,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Management listener: health, metrics and model registration
pub fn create_management_router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(handlers::ping))
        .route("/metrics", get(handlers::metrics))
        .route(
            "/models",
            get(handlers::list_models).post(handlers::register_model),
        )
        .route(
            "/models/{name}",
            get(handlers::get_model).delete(handlers::delete_model),
        )
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

/// Inference listener: predictions only, plus ping
pub fn create_inference_router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(handlers::ping))
        .route("/predictions/{name}", post(handlers::predict))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
