//! Run domain types.
//!
//! A `Run` is one execution of a workflow definition. It is created by
//! `Runner::submit`, mutated only by the dispatcher task that owns it, and
//! persists through its terminal status until external retention deletes it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a run.
///
/// `Completed`, `Failed`, and `Cancelled` are terminal; a run never leaves
/// a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Stable string form used in storage and wire payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// How a run entered the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunSource {
    /// Inline YAML submitted directly.
    Inline,
    /// Remote reference (`<host>:<owner>/<repo>[/<path>][@<ref>]`).
    Remote { reference: String },
    /// Invoked through a named endpoint.
    Endpoint { name: String },
    /// Triggered by a configured webhook.
    Webhook { path: String },
    /// Fired by a cron schedule.
    Schedule { name: String },
}

impl RunSource {
    /// Short label used in log fields and list output.
    pub fn label(&self) -> &'static str {
        match self {
            RunSource::Inline => "inline",
            RunSource::Remote { .. } => "remote",
            RunSource::Endpoint { .. } => "endpoint",
            RunSource::Webhook { .. } => "webhook",
            RunSource::Schedule { .. } => "schedule",
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime overrides
// ---------------------------------------------------------------------------

/// Per-run overrides supplied at submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Overrides the per-step timeout for every step in the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_profile: Option<String>,
}

impl RuntimeOverrides {
    pub fn is_empty(&self) -> bool {
        self.provider.is_none()
            && self.model.is_none()
            && self.timeout_secs.is_none()
            && self.security_profile.is_none()
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// One execution of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Stable opaque id (UUIDv7 text), assigned at submission.
    pub id: String,
    /// Logical workflow id (UUIDv7 of the parsed definition instance).
    pub workflow_id: String,
    /// Workflow name from the definition.
    pub workflow_name: String,
    /// How this run entered the system.
    pub source: RunSource,
    /// Current status.
    pub status: RunStatus,
    /// Input values supplied at submission (merged over defaults).
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    /// Declared outputs, resolved at terminal completion.
    #[serde(default)]
    pub output: HashMap<String, Value>,
    /// Error message; empty unless the run failed or was cancelled.
    #[serde(default)]
    pub error: String,
    /// Step currently executing (empty when pending or terminal).
    #[serde(default)]
    pub current_step_id: String,
    pub completed_step_count: u32,
    pub total_step_count: u32,
    /// Admission priority; higher jumps the queue. Default 0.
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "RuntimeOverrides::is_empty")]
    pub overrides: RuntimeOverrides,
    /// Serialized workflow definition (JSON). Stored so any instance that
    /// acquires the run's job row can resume it.
    pub definition: Value,
    /// Highest event sequence persisted at the last step boundary. Seeds
    /// the event counter on resume so numbering stays monotonic per run
    /// across instances.
    #[serde(default)]
    pub last_event_seq: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Create a fresh pending run with a newly assigned id.
    pub fn new(
        workflow_id: String,
        workflow_name: String,
        source: RunSource,
        inputs: HashMap<String, Value>,
        definition: Value,
        total_step_count: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            workflow_id,
            workflow_name,
            source,
            status: RunStatus::Pending,
            inputs,
            output: HashMap::new(),
            error: String::new(),
            current_step_id: String::new(),
            completed_step_count: 0,
            total_step_count,
            priority: 0,
            correlation_id: None,
            workspace: None,
            profile: None,
            overrides: RuntimeOverrides::default(),
            definition,
            last_event_seq: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Filter for listing runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl RunFilter {
    /// Whether the given run passes this filter (limit is applied by callers).
    pub fn matches(&self, run: &Run) -> bool {
        if let Some(status) = self.status {
            if run.status != status {
                return false;
            }
        }
        if let Some(workflow) = &self.workflow {
            if &run.workflow_name != workflow {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_run() -> Run {
        Run::new(
            Uuid::now_v7().to_string(),
            "daily-digest".to_string(),
            RunSource::Inline,
            HashMap::from([("topic".to_string(), json!("rust"))]),
            json!({"name": "daily-digest", "steps": []}),
            3,
        )
    }

    #[test]
    fn test_run_status_terminality() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_run_status_roundtrip_via_str() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            let parsed: RunStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_run_source_serde_tagging() {
        let src = RunSource::Endpoint {
            name: "deploy-prod".to_string(),
        };
        let json_str = serde_json::to_string(&src).unwrap();
        assert!(json_str.contains("\"type\":\"endpoint\""));
        let parsed: RunSource = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed, src);
        assert_eq!(parsed.label(), "endpoint");
    }

    #[test]
    fn test_new_run_is_pending_with_fresh_id() {
        let a = sample_run();
        let b = sample_run();
        assert_eq!(a.status, RunStatus::Pending);
        assert_ne!(a.id, b.id);
        assert_eq!(a.completed_step_count, 0);
        assert_eq!(a.total_step_count, 3);
        assert!(a.error.is_empty());
    }

    #[test]
    fn test_run_json_roundtrip() {
        let run = sample_run();
        let json_str = serde_json::to_string(&run).unwrap();
        let parsed: Run = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed.id, run.id);
        assert_eq!(parsed.workflow_name, "daily-digest");
        assert_eq!(parsed.inputs.get("topic"), Some(&json!("rust")));
    }

    #[test]
    fn test_filter_matches_status_and_workflow() {
        let mut run = sample_run();
        run.status = RunStatus::Running;

        let filter = RunFilter {
            status: Some(RunStatus::Running),
            workflow: Some("daily-digest".to_string()),
            limit: None,
        };
        assert!(filter.matches(&run));

        let miss = RunFilter {
            status: Some(RunStatus::Completed),
            ..Default::default()
        };
        assert!(!miss.matches(&run));

        let wrong_wf = RunFilter {
            workflow: Some("other".to_string()),
            ..Default::default()
        };
        assert!(!wrong_wf.matches(&run));
    }
}
