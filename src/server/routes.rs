//! Router configuration for the web server.

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::AppState;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        // Queues and workers
        .route("/api/queues/stats", get(handlers::queue_stats))
        .route("/api/queues", delete(handlers::clear_queues))
        .route("/api/workers", get(handlers::workers))
        // Documents
        .route(
            "/api/documents/:document_id/process",
            post(handlers::process_document),
        )
        // Dead letters
        .route("/api/dead-letters", get(handlers::dead_letters))
        .route(
            "/api/dead-letters/:id/retry",
            post(handlers::retry_dead_letter),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
