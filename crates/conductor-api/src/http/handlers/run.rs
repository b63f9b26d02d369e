//! Run submission, inspection, cancellation, and log streaming.

use std::collections::HashMap;
use std::convert::Infallible;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use conductor_types::run::{RunFilter, RunSource};
use futures_util::Stream;
use serde_json::{Value, json};

use crate::http::auth::RequireUser;
use crate::http::error::ApiError;
use crate::state::AppState;

use conductor_core::runner::{SubmitRequest, SubmittedWorkflow};

/// Query keys with meaning to the submission endpoint; everything else
/// becomes a string input.
const RESERVED_KEYS: [&str; 3] = ["ref", "priority", "correlation_id"];

/// POST /v1/runs - submit an inline or referenced workflow.
///
/// The body is workflow YAML; alternatively `?ref=<remote-reference>`
/// resolves the workflow through the fetcher. Remaining query parameters
/// become string inputs.
pub async fn submit_run(
    State(state): State<AppState>,
    RequireUser(_user): RequireUser,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let (workflow, source) = match params.get("ref") {
        Some(reference) => {
            let def = state.loader.load(reference).await?;
            (
                SubmittedWorkflow::Definition(def),
                RunSource::Remote {
                    reference: reference.clone(),
                },
            )
        }
        None => {
            if body.is_empty() {
                return Err(ApiError::new(
                    StatusCode::BAD_REQUEST,
                    "workflow YAML body or ?ref= required",
                ));
            }
            (SubmittedWorkflow::Yaml(body.to_vec()), RunSource::Inline)
        }
    };

    let inputs: HashMap<String, Value> = params
        .iter()
        .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), json!(value)))
        .collect();
    let priority = params
        .get("priority")
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);

    let mut request = SubmitRequest {
        workflow,
        source,
        inputs,
        overrides: Default::default(),
        priority,
        correlation_id: params.get("correlation_id").cloned(),
        workspace: None,
        profile: None,
    };
    // Priority must be non-negative on the submitted job.
    request.priority = request.priority.max(0);

    let run = state.runner.submit(request).await?;
    let location = format!("/v1/runs/{}", run.id);
    Ok((
        StatusCode::ACCEPTED,
        [("Location", location)],
        Json(run),
    ))
}

#[derive(Debug, serde::Deserialize)]
pub struct ListQuery {
    status: Option<String>,
    workflow: Option<String>,
    limit: Option<usize>,
}

/// GET /v1/runs - list with filters.
pub async fn list_runs(
    State(state): State<AppState>,
    RequireUser(_user): RequireUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(|e: String| ApiError::new(StatusCode::BAD_REQUEST, e))?;
    let filter = RunFilter {
        status,
        workflow: query.workflow,
        limit: query.limit,
    };
    let runs = state.runner.list(&filter).await?;
    let count = runs.len();
    Ok(Json(json!({"runs": runs, "count": count})))
}

/// GET /v1/runs/{id} - current snapshot.
pub async fn get_run(
    State(state): State<AppState>,
    RequireUser(_user): RequireUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run = state.runner.get(&id).await?;
    Ok(Json(serde_json::to_value(run).unwrap_or(Value::Null)))
}

/// POST /v1/runs/{id}/cancel - signal cooperative cancellation.
pub async fn cancel_run(
    State(state): State<AppState>,
    RequireUser(_user): RequireUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.runner.cancel(&id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"id": id, "status": "cancelling"})),
    ))
}

/// GET /v1/runs/{id}/logs - SSE stream of run events.
///
/// Honors `Last-Event-ID` for resumption: buffered events with a higher
/// sequence are replayed before the live stream.
pub async fn stream_logs(
    State(state): State<AppState>,
    RequireUser(_user): RequireUser,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let last_seq: u64 = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0);

    let mut subscription = state.runner.subscribe_after(&id, last_seq).await?;

    let stream = async_stream::stream! {
        while let Some(event) = subscription.recv().await {
            let frame = Event::default()
                .id(event.sequence.to_string())
                .event(event.kind.as_str());
            match frame.json_data(&event) {
                Ok(frame) => yield Ok::<_, Infallible>(frame),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping unserializable event");
                }
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
