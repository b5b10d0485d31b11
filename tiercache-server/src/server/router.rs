use super::handlers::{self, AppState};
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Create the Axum router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        // StreamableHTTP command endpoint
        .route("/api/v1/command", post(handlers::command_handler))
        .route("/pubsub/ws", get(handlers::pubsub_websocket))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
