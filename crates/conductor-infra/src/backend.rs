//! Runtime backend selection.
//!
//! `AnyBackend` dispatches the storage capability traits over the
//! configured backend so the API layer stays monomorphic (the runner and
//! its consumers are generic over one concrete type).

use std::time::Duration;

use conductor_core::backend::{
    ApiKeyStore, CheckpointStore, LeaseStore, RunStore, ScheduleStore,
};
use conductor_core::backend::memory::MemoryBackend;
use conductor_types::apikey::ApiKey;
use conductor_types::checkpoint::Checkpoint;
use conductor_types::error::CoreResult;
use conductor_types::lease::{AcquireOutcome, RenewOutcome};
use conductor_types::run::{Run, RunFilter};
use conductor_types::schedule::ScheduleState;

use crate::sqlite::SqliteBackend;

/// Either storage backend behind one concrete type.
pub enum AnyBackend {
    Memory(MemoryBackend),
    Sqlite(SqliteBackend),
}

macro_rules! delegate {
    ($self:ident, $backend:ident => $body:expr) => {
        match $self {
            AnyBackend::Memory($backend) => $body,
            AnyBackend::Sqlite($backend) => $body,
        }
    };
}

impl RunStore for AnyBackend {
    async fn create_run(&self, run: &Run) -> CoreResult<()> {
        delegate!(self, backend => backend.create_run(run).await)
    }

    async fn get_run(&self, id: &str) -> CoreResult<Run> {
        delegate!(self, backend => backend.get_run(id).await)
    }

    async fn update_run(&self, run: &Run) -> CoreResult<()> {
        delegate!(self, backend => backend.update_run(run).await)
    }

    async fn delete_run(&self, id: &str) -> CoreResult<()> {
        delegate!(self, backend => backend.delete_run(id).await)
    }

    async fn list_runs(&self, filter: &RunFilter) -> CoreResult<Vec<Run>> {
        delegate!(self, backend => backend.list_runs(filter).await)
    }
}

impl CheckpointStore for AnyBackend {
    async fn save_checkpoint(&self, cp: &Checkpoint) -> CoreResult<()> {
        delegate!(self, backend => backend.save_checkpoint(cp).await)
    }

    async fn get_checkpoint(&self, run_id: &str) -> CoreResult<Checkpoint> {
        delegate!(self, backend => backend.get_checkpoint(run_id).await)
    }

    async fn delete_checkpoint(&self, run_id: &str) -> CoreResult<()> {
        delegate!(self, backend => backend.delete_checkpoint(run_id).await)
    }
}

impl ScheduleStore for AnyBackend {
    async fn save_schedule_state(&self, state: &ScheduleState) -> CoreResult<()> {
        delegate!(self, backend => backend.save_schedule_state(state).await)
    }

    async fn get_schedule_state(&self, name: &str) -> CoreResult<ScheduleState> {
        delegate!(self, backend => backend.get_schedule_state(name).await)
    }

    async fn list_schedule_states(&self) -> CoreResult<Vec<ScheduleState>> {
        delegate!(self, backend => backend.list_schedule_states().await)
    }

    async fn delete_schedule_state(&self, name: &str) -> CoreResult<()> {
        delegate!(self, backend => backend.delete_schedule_state(name).await)
    }
}

impl LeaseStore for AnyBackend {
    async fn try_acquire(
        &self,
        instance_id: &str,
        ttl: Duration,
    ) -> CoreResult<AcquireOutcome> {
        delegate!(self, backend => backend.try_acquire(instance_id, ttl).await)
    }

    async fn renew(&self, instance_id: &str, ttl: Duration) -> CoreResult<RenewOutcome> {
        delegate!(self, backend => backend.renew(instance_id, ttl).await)
    }

    async fn release(&self, instance_id: &str) -> CoreResult<()> {
        delegate!(self, backend => backend.release(instance_id).await)
    }
}

impl ApiKeyStore for AnyBackend {
    async fn insert_api_key(&self, key: &ApiKey) -> CoreResult<()> {
        delegate!(self, backend => backend.insert_api_key(key).await)
    }

    async fn get_api_key_by_hash(&self, key_hash: &str) -> CoreResult<Option<ApiKey>> {
        delegate!(self, backend => backend.get_api_key_by_hash(key_hash).await)
    }

    async fn list_api_keys(&self) -> CoreResult<Vec<ApiKey>> {
        delegate!(self, backend => backend.list_api_keys().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::run::RunSource;
    use serde_json::json;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_memory_variant_dispatches() {
        let backend = AnyBackend::Memory(MemoryBackend::new());
        let run = Run::new(
            uuid::Uuid::now_v7().to_string(),
            "wf".to_string(),
            RunSource::Inline,
            HashMap::new(),
            json!({"name": "wf", "steps": []}),
            0,
        );
        backend.create_run(&run).await.unwrap();
        assert_eq!(backend.get_run(&run.id).await.unwrap().workflow_name, "wf");
        assert_eq!(
            backend
                .list_runs(&RunFilter::default())
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
