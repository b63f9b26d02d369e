//! Webhook ingress handler.
//!
//! Verification, event filtering, and input mapping live in
//! `conductor_core::webhook`; this handler adapts HTTP and submits the
//! matched workflow.

use std::collections::HashMap;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use conductor_core::runner::{SubmitRequest, SubmittedWorkflow};
use conductor_core::webhook::WebhookDecision;
use conductor_types::run::RunSource;
use serde_json::json;

use crate::http::error::ApiError;
use crate::state::AppState;

/// POST /webhooks/{path} - verified webhook ingress.
pub async fn receive(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let header_map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();

    let decision = state.webhooks.handle(&path, &header_map, &body)?;
    match decision {
        WebhookDecision::Ignored { event } => {
            tracing::debug!(path = path.as_str(), event = event.as_str(), "event ignored");
            Ok((
                StatusCode::OK,
                Json(json!({"status": "ignored", "event": event})),
            ))
        }
        WebhookDecision::Accepted {
            workflow,
            event,
            inputs,
        } => {
            let definition = state.loader.load(&workflow).await?;
            let request = SubmitRequest {
                workflow: SubmittedWorkflow::Definition(definition),
                source: RunSource::Webhook { path: path.clone() },
                inputs,
                overrides: Default::default(),
                priority: 0,
                correlation_id: header_map.get("x-correlation-id").cloned(),
                workspace: None,
                profile: None,
            };
            let run = state.runner.submit(request).await?;
            tracing::info!(
                path = path.as_str(),
                event = event.as_str(),
                run_id = %run.id,
                "webhook triggered run"
            );
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({
                    "status": "accepted",
                    "event": event,
                    "run_id": run.id,
                    "workflow": run.workflow_name,
                })),
            ))
        }
    }
}
