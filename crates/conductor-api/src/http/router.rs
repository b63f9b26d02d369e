//! Axum router with middleware.
//!
//! `/v1/health` and `/v1/version` never require auth. All other `/v1`
//! routes pass through the auth middleware (which attaches the caller
//! identity) and the per-identity rate limiter. Webhook routes carry
//! their own signature-based authentication.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::http::auth;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = Router::new()
        // Runs
        .route(
            "/runs",
            post(handlers::run::submit_run).get(handlers::run::list_runs),
        )
        .route("/runs/{id}", get(handlers::run::get_run))
        .route("/runs/{id}/logs", get(handlers::run::stream_logs))
        .route("/runs/{id}/cancel", post(handlers::run::cancel_run))
        // Endpoint browsing + invocation (scope-filtered)
        .route("/endpoints", get(handlers::endpoint::list_endpoints))
        .route("/endpoints/{name}", get(handlers::endpoint::get_endpoint))
        .route(
            "/endpoints/{name}/runs",
            post(handlers::endpoint::invoke_endpoint).get(handlers::endpoint::list_endpoint_runs),
        )
        // Endpoint administration
        .route(
            "/admin/endpoints",
            get(handlers::admin::list).post(handlers::admin::create),
        )
        .route(
            "/admin/endpoints/{name}",
            get(handlers::admin::get)
                .put(handlers::admin::update)
                .delete(handlers::admin::remove),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::ratelimit_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    let v1 = Router::new()
        .route("/health", get(handlers::system::health))
        .route("/version", get(handlers::system::version))
        .merge(protected);

    Router::new()
        .nest("/v1", v1)
        .route("/webhooks/{*path}", post(handlers::webhook::receive))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Recovered handler panics become plain 500s with no internals leaked.
fn handle_panic(_err: Box<dyn std::any::Any + Send + 'static>) -> axum::response::Response {
    tracing::error!("handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal"})),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
