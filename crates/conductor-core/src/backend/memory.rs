//! In-memory backend.
//!
//! Persists nothing across restarts. Used for tests and single-shot local
//! serving. `list_runs` returns insertion order; the lease is a
//! single-process row with the same acquire/renew semantics as the durable
//! backend.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use conductor_types::apikey::ApiKey;
use conductor_types::checkpoint::Checkpoint;
use conductor_types::error::{CoreError, CoreResult};
use conductor_types::lease::{AcquireOutcome, LeaderLease, RenewOutcome};
use conductor_types::run::{Run, RunFilter};
use conductor_types::schedule::ScheduleState;

use super::{ApiKeyStore, CheckpointStore, LeaseStore, RunStore, ScheduleStore};

#[derive(Default)]
struct RunTable {
    /// Run ids in insertion order.
    order: Vec<String>,
    rows: HashMap<String, Run>,
}

/// In-memory implementation of all storage capabilities.
#[derive(Default)]
pub struct MemoryBackend {
    runs: Mutex<RunTable>,
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    schedules: Mutex<HashMap<String, ScheduleState>>,
    lease: Mutex<Option<LeaderLease>>,
    api_keys: Mutex<Vec<ApiKey>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStore for MemoryBackend {
    async fn create_run(&self, run: &Run) -> CoreResult<()> {
        let mut table = self.runs.lock().expect("runs lock");
        if table.rows.contains_key(&run.id) {
            return Err(CoreError::already_exists(format!(
                "run '{}' already exists",
                run.id
            )));
        }
        table.order.push(run.id.clone());
        table.rows.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, id: &str) -> CoreResult<Run> {
        let table = self.runs.lock().expect("runs lock");
        table
            .rows
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("run '{id}' not found")))
    }

    async fn update_run(&self, run: &Run) -> CoreResult<()> {
        let mut table = self.runs.lock().expect("runs lock");
        match table.rows.get_mut(&run.id) {
            Some(row) => {
                *row = run.clone();
                row.updated_at = Utc::now();
                Ok(())
            }
            None => Err(CoreError::not_found(format!("run '{}' not found", run.id))),
        }
    }

    async fn delete_run(&self, id: &str) -> CoreResult<()> {
        let mut table = self.runs.lock().expect("runs lock");
        if table.rows.remove(id).is_some() {
            table.order.retain(|r| r != id);
        }
        drop(table);
        self.checkpoints.lock().expect("checkpoints lock").remove(id);
        Ok(())
    }

    async fn list_runs(&self, filter: &RunFilter) -> CoreResult<Vec<Run>> {
        let table = self.runs.lock().expect("runs lock");
        let mut out = Vec::new();
        for id in &table.order {
            let run = &table.rows[id];
            if filter.matches(run) {
                out.push(run.clone());
                if let Some(limit) = filter.limit {
                    if out.len() >= limit {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }
}

impl CheckpointStore for MemoryBackend {
    async fn save_checkpoint(&self, cp: &Checkpoint) -> CoreResult<()> {
        self.checkpoints
            .lock()
            .expect("checkpoints lock")
            .insert(cp.run_id.clone(), cp.clone());
        Ok(())
    }

    async fn get_checkpoint(&self, run_id: &str) -> CoreResult<Checkpoint> {
        self.checkpoints
            .lock()
            .expect("checkpoints lock")
            .get(run_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("no checkpoint for run '{run_id}'")))
    }

    async fn delete_checkpoint(&self, run_id: &str) -> CoreResult<()> {
        self.checkpoints
            .lock()
            .expect("checkpoints lock")
            .remove(run_id);
        Ok(())
    }
}

impl ScheduleStore for MemoryBackend {
    async fn save_schedule_state(&self, state: &ScheduleState) -> CoreResult<()> {
        self.schedules
            .lock()
            .expect("schedules lock")
            .insert(state.name.clone(), state.clone());
        Ok(())
    }

    async fn get_schedule_state(&self, name: &str) -> CoreResult<ScheduleState> {
        self.schedules
            .lock()
            .expect("schedules lock")
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("schedule '{name}' not found")))
    }

    async fn list_schedule_states(&self) -> CoreResult<Vec<ScheduleState>> {
        let mut out: Vec<ScheduleState> = self
            .schedules
            .lock()
            .expect("schedules lock")
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn delete_schedule_state(&self, name: &str) -> CoreResult<()> {
        self.schedules.lock().expect("schedules lock").remove(name);
        Ok(())
    }
}

impl LeaseStore for MemoryBackend {
    async fn try_acquire(&self, instance_id: &str, ttl: Duration) -> CoreResult<AcquireOutcome> {
        let now = Utc::now();
        let mut slot = self.lease.lock().expect("lease lock");
        match slot.as_ref() {
            Some(lease) if !lease.is_expired(now) && lease.holder_instance_id != instance_id => {
                Ok(AcquireOutcome::HeldByOther {
                    holder_instance_id: lease.holder_instance_id.clone(),
                })
            }
            _ => {
                let lease = LeaderLease {
                    holder_instance_id: instance_id.to_string(),
                    acquired_at: now,
                    expires_at: now
                        + chrono::Duration::from_std(ttl)
                            .map_err(|e| CoreError::invalid_input(e.to_string()))?,
                };
                *slot = Some(lease.clone());
                Ok(AcquireOutcome::Acquired(lease))
            }
        }
    }

    async fn renew(&self, instance_id: &str, ttl: Duration) -> CoreResult<RenewOutcome> {
        let now = Utc::now();
        let mut slot = self.lease.lock().expect("lease lock");
        match slot.as_mut() {
            Some(lease) if lease.holder_instance_id == instance_id && !lease.is_expired(now) => {
                lease.expires_at = now
                    + chrono::Duration::from_std(ttl)
                        .map_err(|e| CoreError::invalid_input(e.to_string()))?;
                Ok(RenewOutcome::Renewed)
            }
            _ => Ok(RenewOutcome::Lost),
        }
    }

    async fn release(&self, instance_id: &str) -> CoreResult<()> {
        let mut slot = self.lease.lock().expect("lease lock");
        if slot
            .as_ref()
            .is_some_and(|l| l.holder_instance_id == instance_id)
        {
            *slot = None;
        }
        Ok(())
    }
}

impl ApiKeyStore for MemoryBackend {
    async fn insert_api_key(&self, key: &ApiKey) -> CoreResult<()> {
        let mut keys = self.api_keys.lock().expect("api_keys lock");
        if keys.iter().any(|k| k.key_hash == key.key_hash) {
            return Err(CoreError::already_exists("api key already exists"));
        }
        keys.push(key.clone());
        Ok(())
    }

    async fn get_api_key_by_hash(&self, key_hash: &str) -> CoreResult<Option<ApiKey>> {
        Ok(self
            .api_keys
            .lock()
            .expect("api_keys lock")
            .iter()
            .find(|k| k.key_hash == key_hash)
            .cloned())
    }

    async fn list_api_keys(&self) -> CoreResult<Vec<ApiKey>> {
        Ok(self.api_keys.lock().expect("api_keys lock").clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
