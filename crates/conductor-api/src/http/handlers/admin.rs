//! Endpoint CRUD for operators.
//!
//! Admin routes require an admin credential (empty scope list). Scoped
//! keys get a plain 403 here; the information-hiding 404 applies only to
//! the invocation plane.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use conductor_types::apikey::AuthenticatedUser;
use conductor_types::endpoint::Endpoint;
use serde_json::{Value, json};

use crate::http::auth::RequireUser;
use crate::http::error::ApiError;
use crate::state::AppState;

fn require_admin(user: &AuthenticatedUser) -> Result<(), ApiError> {
    if user.scopes.is_empty() {
        Ok(())
    } else {
        Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "admin credential required",
        ))
    }
}

/// GET /v1/admin/endpoints
pub async fn list(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
) -> Result<Json<Value>, ApiError> {
    require_admin(&user)?;
    let endpoints = state.endpoints.list();
    let count = endpoints.len();
    Ok(Json(json!({"endpoints": endpoints, "count": count})))
}

/// POST /v1/admin/endpoints
pub async fn create(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
    Json(endpoint): Json<Endpoint>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&user)?;
    validate_rate_limit(&endpoint)?;
    let name = endpoint.name.clone();
    state.endpoints.add(endpoint)?;
    tracing::info!(endpoint = name.as_str(), "endpoint registered");
    Ok((StatusCode::CREATED, Json(json!({"name": name}))))
}

/// GET /v1/admin/endpoints/{name}
pub async fn get(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
    Path(name): Path<String>,
) -> Result<Json<Endpoint>, ApiError> {
    require_admin(&user)?;
    state
        .endpoints
        .get(&name)
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("endpoint '{name}' not found")))
}

/// PUT /v1/admin/endpoints/{name}
pub async fn update(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
    Path(name): Path<String>,
    Json(mut endpoint): Json<Endpoint>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&user)?;
    endpoint.name = name.clone();
    validate_rate_limit(&endpoint)?;
    state.endpoints.update(endpoint)?;
    tracing::info!(endpoint = name.as_str(), "endpoint updated");
    Ok(Json(json!({"name": name})))
}

/// DELETE /v1/admin/endpoints/{name}
pub async fn remove(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&user)?;
    state.endpoints.remove(&name)?;
    tracing::info!(endpoint = name.as_str(), "endpoint removed");
    Ok(Json(json!({"name": name, "removed": true})))
}

fn validate_rate_limit(endpoint: &Endpoint) -> Result<(), ApiError> {
    if let Some(limit) = &endpoint.rate_limit {
        conductor_core::ratelimit::RateLimit::parse(limit)?;
    }
    Ok(())
}
