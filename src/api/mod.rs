//! API layer for the gateway.
//!
//! This module contains the HTTP handlers, request/response models, key
//! helpers and the assembled axum router.

pub mod auth;
pub mod handlers;
pub mod models;

// Re-export commonly used types
pub use handlers::{chat_completions, embeddings, health, list_models, metrics_handler, AppState};
pub use models::{ChatCompletionRequest, HealthResponse, ModelList};

use crate::core::{request_id_middleware, MetricsMiddleware};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};

/// Directory served when the web UI is enabled.
pub const STATIC_DIR: &str = "static";

/// Build the router with all endpoints and middleware.
pub fn build_router(state: Arc<AppState>, enable_web: bool) -> Router {
    let api_routes = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/chat/completions", post(chat_completions))
        .route("/v1", post(chat_completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
        .layer(axum::middleware::from_fn(MetricsMiddleware::track_metrics))
        .with_state(state);

    let mut app = Router::new()
        .merge(api_routes)
        .route("/metrics", get(metrics_handler));

    if enable_web {
        let index = format!("{}/index.html", STATIC_DIR);
        app = app
            .nest_service("/static", ServeDir::new(STATIC_DIR))
            .fallback_service(ServeDir::new(STATIC_DIR).fallback(ServeFile::new(index)));
    }

    app.layer(axum::middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
