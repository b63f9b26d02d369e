//! Schedule state tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted state for a named cron schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleState {
    pub name: String,
    /// Timestamp of the last fire, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fire: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub error_count: u64,
    pub enabled: bool,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleState {
    /// Fresh state for a newly registered schedule.
    pub fn new(name: String) -> Self {
        Self {
            name,
            last_fire: None,
            success_count: 0,
            error_count: 0,
            enabled: true,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_schedule_state_defaults() {
        let state = ScheduleState::new("nightly".to_string());
        assert!(state.enabled);
        assert!(state.last_fire.is_none());
        assert_eq!(state.success_count, 0);
        assert_eq!(state.error_count, 0);
    }

    #[test]
    fn test_schedule_state_json_roundtrip() {
        let mut state = ScheduleState::new("nightly".to_string());
        state.last_fire = Some(Utc::now());
        state.success_count = 12;
        let json_str = serde_json::to_string(&state).unwrap();
        let parsed: ScheduleState = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed.name, "nightly");
        assert_eq!(parsed.success_count, 12);
        assert!(parsed.last_fire.is_some());
    }
}
