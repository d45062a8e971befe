//! # Server Module
//!
//! Router construction and the middleware stack. The dispatch routes run
//! through Auth → RateLimit → handler; `/`, `/health` and `/metrics`
//! bypass auth entirely.

pub mod handlers;
pub mod state;

pub use state::AppState;

use axum::http::HeaderValue;
use axum::{
    middleware,
    routing::{any, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, Any, CorsLayer},
    trace::{self, TraceLayer},
};
use tracing::Level;

/// Build the CORS layer from configuration; "*" anywhere in the list
/// means permissive.
fn cors_layer(state: &AppState) -> CorsLayer {
    let origins = state.config.cors_origin_list();
    if origins.iter().any(|origin| origin == "*") {
        return CorsLayer::permissive();
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Create the router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state);

    Router::new()
        // Dispatch plane
        .route("/api/chat", post(handlers::chat))
        .route("/api/chat/stream", post(handlers::chat_stream))
        .route("/api/models", get(handlers::list_models))
        .route("/api/models/pull/{name}", post(handlers::pull_model))
        // Admin surface
        .route("/api/admin/stats", get(handlers::admin_stats))
        .route("/api/admin/backends", get(handlers::admin_backends))
        .route("/api/admin/cache/clear", post(handlers::admin_cache_clear))
        // External collaborator placeholders
        .route("/api/finetune", any(handlers::finetune_placeholder))
        .route("/api/finetune/{*path}", any(handlers::finetune_placeholder))
        // Unauthenticated surface
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        // Dispatch-route ordering is Auth → RateLimit → handler: the
        // auth layer is installed outside the limiter, so a rejected
        // bearer never charges a rate-limit bucket. Non-limited endpoint
        // classes pass through the limiter untouched.
        .layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::auth_middleware,
        ))
        .layer(
            ServiceBuilder::new()
                .layer(CompressionLayer::new())
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                        .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(cors),
        )
        .with_state(state)
}
