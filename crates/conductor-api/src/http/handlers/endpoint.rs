//! Scope-filtered endpoint browsing and invocation.
//!
//! Visibility: an endpoint is visible when it is public or the caller's
//! scopes match its name. A caller without access receives a 404 with
//! body `endpoint "<name>" not found` -- existence is never disclosed.
//!
//! Invocation supports async (202 + Location), synchronous
//! (`?wait=true`, blocking until terminal or timeout), and SSE
//! (`&stream=true`) modes, all behind the endpoint's token-bucket rate
//! limit.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Extension, Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use conductor_core::endpoint::scope_matches;
use conductor_core::ratelimit::{RateDecision, RateLimit};
use conductor_core::runner::{SubmitRequest, SubmittedWorkflow};
use conductor_types::endpoint::Endpoint;
use conductor_types::error::ErrorKind;
use conductor_types::run::{RunFilter, RunSource, RunStatus};
use serde_json::{Value, json};

use crate::http::auth::AuthContext;
use crate::http::error::ApiError;
use crate::state::AppState;

/// Default and maximum synchronous wait.
const DEFAULT_WAIT_SECS: u64 = 30;
const MAX_WAIT_SECS: u64 = 300;

fn visible(context: &AuthContext, endpoint: &Endpoint) -> bool {
    if endpoint.public {
        return true;
    }
    match &context.user {
        Some(user) => scope_matches(&user.scopes, &endpoint.name),
        None => false,
    }
}

fn lookup_visible(
    state: &AppState,
    context: &AuthContext,
    name: &str,
) -> Result<Endpoint, ApiError> {
    state
        .endpoints
        .get(name)
        .filter(|endpoint| visible(context, endpoint))
        .ok_or_else(|| ApiError::endpoint_hidden(name))
}

/// GET /v1/endpoints - endpoints visible to the caller.
pub async fn list_endpoints(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Json<Value> {
    let endpoints: Vec<Endpoint> = state
        .endpoints
        .list()
        .into_iter()
        .filter(|endpoint| visible(&context, endpoint))
        .collect();
    let count = endpoints.len();
    Json(json!({"endpoints": endpoints, "count": count}))
}

/// GET /v1/endpoints/{name} - a single visible endpoint.
pub async fn get_endpoint(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(name): Path<String>,
) -> Result<Json<Endpoint>, ApiError> {
    lookup_visible(&state, &context, &name).map(Json)
}

/// GET /v1/endpoints/{name}/runs - runs created through this endpoint.
pub async fn list_endpoint_runs(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    lookup_visible(&state, &context, &name)?;
    let runs: Vec<_> = state
        .runner
        .list(&RunFilter::default())
        .await?
        .into_iter()
        .filter(|run| matches!(&run.source, RunSource::Endpoint { name: n } if n == &name))
        .collect();
    let count = runs.len();
    Ok(Json(json!({"runs": runs, "count": count})))
}

#[derive(Debug, serde::Deserialize)]
pub struct InvokeQuery {
    #[serde(default)]
    wait: Option<bool>,
    #[serde(default)]
    stream: Option<bool>,
    #[serde(default)]
    timeout: Option<u64>,
}

fn rate_headers(decision: &RateDecision) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("X-RateLimit-Limit", HeaderValue::from(decision.limit));
    headers.insert(
        "X-RateLimit-Remaining",
        HeaderValue::from(decision.remaining),
    );
    let reset = chrono::Utc::now().timestamp() + decision.reset_after.as_secs() as i64;
    headers.insert("X-RateLimit-Reset", HeaderValue::from(reset));
    headers
}

/// POST /v1/endpoints/{name}/runs - invoke the endpoint's workflow.
pub async fn invoke_endpoint(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(name): Path<String>,
    Query(query): Query<InvokeQuery>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let endpoint = lookup_visible(&state, &context, &name)?;

    // Per-endpoint token bucket.
    let mut limit_headers = HeaderMap::new();
    if let Some(limit_str) = &endpoint.rate_limit {
        match RateLimit::parse(limit_str) {
            Ok(limit) => {
                let decision = state.endpoint_limits.check_limit(&name, &limit);
                limit_headers = rate_headers(&decision);
                if !decision.allowed {
                    let retry = decision.retry_after.as_secs().max(1);
                    limit_headers.insert("Retry-After", HeaderValue::from(retry));
                    return Ok((
                        StatusCode::TOO_MANY_REQUESTS,
                        limit_headers,
                        Json(json!({"error": "rate limit exceeded"})),
                    )
                        .into_response());
                }
            }
            Err(e) => {
                tracing::warn!(
                    endpoint = name.as_str(),
                    error = %e,
                    "invalid rate limit string, not enforcing"
                );
            }
        }
    }

    // Caller-supplied inputs merge over endpoint defaults.
    let mut inputs = endpoint.inputs.clone();
    if !body.is_empty() {
        let supplied: HashMap<String, Value> = serde_json::from_slice(&body)
            .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid inputs: {e}")))?;
        inputs.extend(supplied);
    }

    let definition = state.loader.load(&endpoint.workflow).await?;
    let request = SubmitRequest {
        workflow: SubmittedWorkflow::Definition(definition),
        source: RunSource::Endpoint { name: name.clone() },
        inputs,
        overrides: Default::default(),
        priority: 0,
        correlation_id: None,
        workspace: None,
        profile: None,
    };
    let run = state.runner.submit(request).await?;

    let wait = query.wait.unwrap_or(false);
    if !wait {
        let location = format!("/v1/runs/{}", run.id);
        let mut response = (StatusCode::ACCEPTED, Json(run)).into_response();
        response
            .headers_mut()
            .insert("Location", HeaderValue::from_str(&location).expect("ascii"));
        response.headers_mut().extend(limit_headers);
        return Ok(response);
    }

    let timeout = Duration::from_secs(
        query
            .timeout
            .or(endpoint.timeout_secs)
            .unwrap_or(DEFAULT_WAIT_SECS)
            .min(MAX_WAIT_SECS),
    );

    if query.stream.unwrap_or(false) {
        let response = stream_invocation(state, run.id.clone(), timeout).await?;
        let mut response = response.into_response();
        response.headers_mut().extend(limit_headers);
        return Ok(response);
    }

    let mut response = match state.runner.wait_terminal(&run.id, timeout).await {
        Ok(done) => match done.status {
            RunStatus::Completed => (
                StatusCode::OK,
                Json(json!({"status": done.status, "output": done.output})),
            )
                .into_response(),
            RunStatus::Failed => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": done.status, "error": done.error})),
            )
                .into_response(),
            RunStatus::Cancelled => (
                StatusCode::CONFLICT,
                Json(json!({"status": done.status, "error": done.error})),
            )
                .into_response(),
            other => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": other, "error": "run not terminal"})),
            )
                .into_response(),
        },
        Err(e) if e.kind() == ErrorKind::Timeout => {
            // Hand the id back so the caller can poll.
            let mut response = (
                StatusCode::REQUEST_TIMEOUT,
                Json(json!({"error": "execution timed out", "run_id": run.id})),
            )
                .into_response();
            response.headers_mut().insert(
                "X-Run-ID",
                HeaderValue::from_str(&run.id).expect("run ids are ascii"),
            );
            response
        }
        Err(e) => return Err(e.into()),
    };
    response.headers_mut().extend(limit_headers);
    Ok(response)
}

/// Synchronous invocation as an SSE stream: `start`, `log`, then one of
/// `done`, `timeout`, or `error`.
async fn stream_invocation(
    state: AppState,
    run_id: String,
    timeout: Duration,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let mut subscription = state.runner.subscribe_after(&run_id, 0).await?;
    let deadline = tokio::time::Instant::now() + timeout;

    let stream = async_stream::stream! {
        let start = Event::default()
            .event("start")
            .json_data(json!({"run_id": &run_id}))
            .expect("static frame");
        yield Ok::<_, Infallible>(start);

        loop {
            match tokio::time::timeout_at(deadline, subscription.recv()).await {
                Err(_) => {
                    let frame = Event::default()
                        .event("timeout")
                        .json_data(json!({"run_id": &run_id}))
                        .expect("static frame");
                    yield Ok(frame);
                    return;
                }
                Ok(None) => break,
                Ok(Some(event)) => {
                    if let Ok(frame) = Event::default()
                        .event("log")
                        .id(event.sequence.to_string())
                        .json_data(&event)
                    {
                        yield Ok(frame);
                    }
                }
            }
        }

        // Channel closed: the run is terminal.
        match state.runner.get(&run_id).await {
            Ok(run) if run.status == RunStatus::Completed => {
                if let Ok(frame) = Event::default()
                    .event("done")
                    .json_data(json!({"status": run.status, "output": run.output}))
                {
                    yield Ok(frame);
                }
            }
            Ok(run) => {
                if let Ok(frame) = Event::default()
                    .event("error")
                    .json_data(json!({"status": run.status, "error": run.error}))
                {
                    yield Ok(frame);
                }
            }
            Err(e) => {
                if let Ok(frame) = Event::default()
                    .event("error")
                    .json_data(json!({"error": e.to_string()}))
                {
                    yield Ok(frame);
                }
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
