//! Run event types for the log/event streaming plane.
//!
//! Each run produces a strictly increasing sequence of `RunEvent`s starting
//! at 1. Subscribers receive events in sequence order; a subscriber that
//! falls behind drops its oldest buffered entries rather than stalling the
//! dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of a run event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// What a run event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Free-form log line from a step.
    Log,
    /// A step began executing.
    StepStart,
    /// A step finished (payload carries output summary and metrics).
    StepComplete,
    /// The run's status changed.
    Status,
    /// Aggregate statistics (tokens, cost).
    Stats,
    /// The run's final resolved output.
    Output,
}

impl EventKind {
    /// Stable string form used as the SSE `event:` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Log => "log",
            EventKind::StepStart => "step_start",
            EventKind::StepComplete => "step_complete",
            EventKind::Status => "status",
            EventKind::Stats => "stats",
            EventKind::Output => "output",
        }
    }
}

/// One entry in a run's event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Strictly increasing per run, starting at 1.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    pub kind: EventKind,
    pub payload: Value,
}

/// Execution metrics returned by a step (tokens/cost for LLM steps).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    pub duration_ms: u64,
}
