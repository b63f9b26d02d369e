//! Authentication and request rate-limiting middleware.
//!
//! Credential sources, in order: `Authorization: Bearer <token>` (API key
//! or the statically configured token), then `X-API-Key`. Credentials in
//! query parameters are always rejected with 401. Requests on the local
//! socket bypass auth when configured, as do requests while a
//! `disable-enforcement` override is active -- every bypassed request is
//! logged at WARN with path, method, remote address, and override kind.
//!
//! The middleware attaches an `AuthContext`; handlers that require a
//! caller use the `RequireUser` extractor, endpoint browsing uses the
//! optional context directly (missing auth hides non-public endpoints
//! rather than rejecting).

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use conductor_core::auth::validate_api_key;
use conductor_core::webhook::constant_time_eq;
use conductor_types::apikey::AuthenticatedUser;

use crate::http::error::ApiError;
use crate::state::AppState;

/// Marker extension describing which listener accepted the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    /// Local (Unix) socket; remote address is empty.
    Local,
    /// TCP listener.
    Tcp,
}

/// Identity attached by the auth middleware. `user` is `None` when no
/// credentials were presented and the route tolerates anonymous access.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user: Option<AuthenticatedUser>,
}

/// Extractor for routes that require an authenticated caller.
pub struct RequireUser(pub AuthenticatedUser);

impl FromRequestParts<AppState> for RequireUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let context = parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .unwrap_or(AuthContext { user: None });
        match context.user {
            Some(user) => Ok(Self(user)),
            None => Err(ApiError::unauthorized(
                "missing API key: provide 'Authorization: Bearer <key>' or 'X-API-Key: <key>'",
            )),
        }
    }
}

const QUERY_CREDENTIAL_KEYS: [&str; 3] = ["api_key", "token", "access_token"];

/// Authenticate the request and attach an `AuthContext`.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let peer = request
        .extensions()
        .get::<PeerKind>()
        .copied()
        .unwrap_or(PeerKind::Tcp);
    let path = request.uri().path().to_string();
    let method = request.method().clone();
    let remote = match peer {
        PeerKind::Local => String::new(),
        PeerKind::Tcp => request
            .extensions()
            .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
            .map(|info| info.0.to_string())
            .unwrap_or_default(),
    };

    // Query-parameter credentials are rejected even when valid ones are
    // also present in headers.
    if let Some(query) = request.uri().query() {
        let has_query_credentials = query.split('&').any(|pair| {
            pair.split_once('=')
                .is_some_and(|(key, _)| QUERY_CREDENTIAL_KEYS.contains(&key))
        });
        if has_query_credentials {
            return Err(ApiError::unauthorized(
                "credentials in query parameters are not accepted",
            ));
        }
    }

    // Local-socket bypass: detected by the empty remote address of the
    // local listener.
    if peer == PeerKind::Local && state.config.auth.allow_local_bypass {
        request.extensions_mut().insert(AuthContext {
            user: Some(AuthenticatedUser::anonymous()),
        });
        return Ok(next.run(request).await);
    }

    // Operator override: skip enforcement but audit every request.
    if let Some(active) = state.overrides.enforcement_disabled() {
        tracing::warn!(
            path = path.as_str(),
            method = %method,
            remote = remote.as_str(),
            override_kind = active.kind.as_str(),
            reason = active.reason.as_str(),
            "auth enforcement bypassed by security override"
        );
        request.extensions_mut().insert(AuthContext {
            user: Some(AuthenticatedUser::anonymous()),
        });
        return Ok(next.run(request).await);
    }

    if !state.config.auth.require_auth {
        request.extensions_mut().insert(AuthContext {
            user: Some(AuthenticatedUser::anonymous()),
        });
        return Ok(next.run(request).await);
    }

    let context = match extract_credential(&request) {
        Some(credential) => AuthContext {
            user: Some(validate_credential(&state, &credential).await?),
        },
        None => AuthContext { user: None },
    };
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

enum Credential {
    Bearer(String),
    ApiKey(String),
}

fn extract_credential(request: &Request) -> Option<Credential> {
    let headers = request.headers();
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(Credential::Bearer(token.trim().to_string()));
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|key| Credential::ApiKey(key.trim().to_string()))
}

async fn validate_credential(
    state: &AppState,
    credential: &Credential,
) -> Result<AuthenticatedUser, ApiError> {
    let presented = match credential {
        Credential::Bearer(token) => {
            // Statically configured bearer token acts as an admin key.
            if let Some(configured) = &state.config.auth.bearer_token {
                if constant_time_eq(configured.as_bytes(), token.as_bytes()) {
                    return Ok(AuthenticatedUser {
                        id: "static-token".to_string(),
                        name: "static-token".to_string(),
                        scopes: Vec::new(),
                    });
                }
            }
            token
        }
        Credential::ApiKey(key) => key,
    };

    validate_api_key(state.backend.as_ref(), presented)
        .await
        .map_err(ApiError::from)
}

// ---------------------------------------------------------------------------
// Per-identity request rate limiting
// ---------------------------------------------------------------------------

/// Token-bucket limit per authenticated identity; unauthenticated
/// requests share one bucket.
pub async fn ratelimit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let key = request
        .extensions()
        .get::<AuthContext>()
        .and_then(|ctx| ctx.user.as_ref())
        .map(|user| format!("user:{}", user.id))
        .unwrap_or_else(|| "anonymous".to_string());

    let limits = &state.config.limits;
    let decision = state.request_limits.check(
        &key,
        limits.burst_size,
        limits.requests_per_second,
    );
    if !decision.allowed {
        let retry = decision.retry_after.as_secs().max(1) as u32;
        return Err(ApiError::new(
            axum::http::StatusCode::TOO_MANY_REQUESTS,
            "rate limit exceeded",
        )
        .with_retry_after(retry));
    }
    Ok(next.run(request).await)
}
