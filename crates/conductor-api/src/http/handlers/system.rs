//! Liveness and build-info handlers. Never require auth.

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::state::AppState;

/// GET /v1/health - liveness plus component checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "instance_id": state.instance_id,
        "components": {
            "runner": {
                "active_runs": state.runner.active_run_count(),
                "draining": state.runner.is_draining(),
            },
            "endpoints": state.endpoints.count(),
            "webhooks": state.webhooks.len(),
        },
        "uptime_secs": (chrono::Utc::now() - state.started_at).num_seconds(),
    }))
}

/// GET /v1/version - build info.
pub async fn version() -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
