//! Checkpoint types for the resume subsystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-run resume snapshot.
///
/// A checkpoint always refers to a step that has started but not yet
/// completed. Completing a step either advances the checkpoint to the next
/// step or, at the last step, atomically writes terminal status and removes
/// the checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    /// The step currently in flight.
    pub step_id: String,
    /// Index of that step in definition order (0-based).
    pub step_index: u32,
    /// The template/variable environment accumulated through preceding
    /// steps. Opaque to the backend; the runner passes it back to the
    /// step executor on resume.
    pub context: Value,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(run_id: String, step_id: String, step_index: u32, context: Value) -> Self {
        Self {
            run_id,
            step_id,
            step_index,
            context,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checkpoint_json_roundtrip() {
        let cp = Checkpoint::new(
            "run-1".to_string(),
            "summarize".to_string(),
            2,
            json!({"steps": {"gather": {"output": "data"}}}),
        );
        let json_str = serde_json::to_string(&cp).unwrap();
        let parsed: Checkpoint = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed.run_id, "run-1");
        assert_eq!(parsed.step_index, 2);
        assert_eq!(parsed.context["steps"]["gather"]["output"], "data");
    }
}
