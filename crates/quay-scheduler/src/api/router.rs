//! API Router configuration

use super::handlers;
use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the scheduler router
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // Agent links
        .route("/agents/subscribe", post(handlers::subscribe_agent))
        .route("/agents/events", post(handlers::agent_event))
        .route("/agents/scale", post(handlers::scaling_trigger))
        // Models
        .route("/models", get(handlers::list_models).post(handlers::apply_model))
        .route(
            "/models/:name",
            get(handlers::get_model).delete(handlers::delete_model),
        )
        // Servers
        .route("/servers", get(handlers::list_servers));

    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
