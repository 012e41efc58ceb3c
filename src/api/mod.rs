//! HTTP surface of the message management service.

pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::ApiError;
pub use handlers::AppState;

/// Build the service router.
pub fn router(state: Arc<AppState>) -> Router {
    let queue_routes = Router::new()
        .route(
            "/messages",
            get(handlers::get_messages)
                .post(handlers::send_message)
                .delete(handlers::purge_queue),
        )
        .route("/messages/:message_id", delete(handlers::delete_message))
        .route("/messages/:message_id/move", post(handlers::move_message))
        .route("/bulk-delete", post(handlers::bulk_delete))
        .route("/bulk-move", post(handlers::bulk_move))
        .route("/import", post(handlers::import_messages))
        .route("/export", post(handlers::export_messages));

    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Connections
        .route(
            "/api/connections",
            get(handlers::list_connections).post(handlers::register_connection),
        )
        .route(
            "/api/connections/:id",
            get(handlers::get_connection).delete(handlers::remove_connection),
        )
        .route("/api/connections/:id/liveness", post(handlers::refresh_liveness))
        .route("/api/connections/:id/queues", get(handlers::list_queues))
        // Messages
        .nest("/api/connections/:id/queues/:queue", queue_routes)
        // State
        .with_state(state)
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
