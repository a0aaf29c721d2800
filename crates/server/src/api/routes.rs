use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::{audit, certificates, handlers, middleware::metrics_middleware, orchestrator};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // API routes
    let api_routes = Router::new()
        // Health and config
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::get_config))
        // Audit
        .route("/audit", get(audit::query_audit))
        // Certificate requests
        .route(
            "/certificates",
            post(certificates::submit_certificate).get(certificates::list_certificates),
        )
        .route("/certificates/{id}", get(certificates::get_certificate))
        .route(
            "/certificates/{id}/revoke",
            post(certificates::revoke_certificate),
        )
        // Orchestrator
        .route("/orchestrator/status", get(orchestrator::get_status));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::metrics_handler))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
