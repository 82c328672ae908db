//! # whisper-api
//!
//! REST layer for Whisper. Everything realtime rides the gateway socket;
//! this crate serves the request/response surface: public key lookup,
//! encrypted contact backups, attachment presigning, and the admin GC
//! trigger.

pub mod middleware;
pub mod routes;

use axum::{middleware as axum_middleware, Router};
use std::sync::Arc;
use whisper_db::storage::StorageClient;
use whisper_db::Database;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    /// S3/MinIO presigner for attachment access.
    pub storage: StorageClient,
}

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let state = Arc::new(state);

    // Bearer sessionToken required.
    let protected = Router::new()
        .merge(routes::users::router())
        .merge(routes::backup::router())
        .merge(routes::attachments::router())
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    // Liveness and admin (admin authenticates by shared token, not session).
    let open = Router::new()
        .merge(routes::health::router())
        .merge(routes::attachments::admin_router())
        .merge(routes::users::admin_router());

    protected
        .merge(open)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
