use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

// API Routes - REST API for programmatic access
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/api",
        Router::new()
            // Natural-language and raw SQL
            .route("/query", post(handlers::api::nl_query))
            .route("/execute-raw-sql", post(handlers::api::execute_raw_sql))
            .route("/tables/batch", post(handlers::api::execute_batch))
            // Connections and schema
            .route("/connections", get(handlers::api::list_connections))
            .route("/schema/{connection}", get(handlers::api::get_schema))
            .route(
                "/schema/{connection}/refresh",
                post(handlers::api::refresh_schema),
            )
            // System status
            .route("/status", get(handlers::api::system_status)),
    )
}
