//! Storage capability traits.
//!
//! The backend is expressed as a family of small capability contracts so
//! minimal backends can implement only what they need: `RunStore`,
//! `CheckpointStore`, `ScheduleStore`, and (for distributed mode)
//! `LeaseStore`. `Backend` is a blanket supertrait over the first three.
//!
//! All operations are safe for concurrent use. `create_run` is linearizable
//! with respect to other `create_run`/`get_run` calls on the same id. No
//! operation blocks on a per-run lock held by the runner.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

pub mod memory;

use std::future::Future;
use std::time::Duration;

use conductor_types::apikey::ApiKey;
use conductor_types::checkpoint::Checkpoint;
use conductor_types::error::CoreResult;
use conductor_types::lease::{AcquireOutcome, RenewOutcome};
use conductor_types::run::{Run, RunFilter};
use conductor_types::schedule::ScheduleState;

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Run row storage.
pub trait RunStore: Send + Sync {
    /// Create a run record. Fails with `AlreadyExists` if the id is taken.
    fn create_run(&self, run: &Run) -> impl Future<Output = CoreResult<()>> + Send;

    /// Fetch a run by id, or `NotFound`.
    fn get_run(&self, id: &str) -> impl Future<Output = CoreResult<Run>> + Send;

    /// Replace a run record. Fails with `NotFound` if the id is absent.
    /// Bumps `updated_at`.
    fn update_run(&self, run: &Run) -> impl Future<Output = CoreResult<()>> + Send;

    /// Delete a run and its checkpoint. Idempotent.
    fn delete_run(&self, id: &str) -> impl Future<Output = CoreResult<()>> + Send;

    /// List runs matching the filter. Ordering is stable within a single
    /// backend: insertion order in memory, `started_at DESC` on SQLite.
    fn list_runs(&self, filter: &RunFilter)
    -> impl Future<Output = CoreResult<Vec<Run>>> + Send;
}

/// Per-run resume snapshot storage.
pub trait CheckpointStore: Send + Sync {
    /// Persist the snapshot for `cp.run_id`, replacing any previous one.
    /// The write is atomic with respect to readers.
    fn save_checkpoint(&self, cp: &Checkpoint) -> impl Future<Output = CoreResult<()>> + Send;

    /// Most recently saved snapshot for the run, or `NotFound`.
    fn get_checkpoint(&self, run_id: &str)
    -> impl Future<Output = CoreResult<Checkpoint>> + Send;

    /// Remove the snapshot. Idempotent.
    fn delete_checkpoint(&self, run_id: &str) -> impl Future<Output = CoreResult<()>> + Send;
}

/// Schedule state storage.
pub trait ScheduleStore: Send + Sync {
    fn save_schedule_state(
        &self,
        state: &ScheduleState,
    ) -> impl Future<Output = CoreResult<()>> + Send;

    fn get_schedule_state(
        &self,
        name: &str,
    ) -> impl Future<Output = CoreResult<ScheduleState>> + Send;

    fn list_schedule_states(&self)
    -> impl Future<Output = CoreResult<Vec<ScheduleState>>> + Send;

    fn delete_schedule_state(&self, name: &str)
    -> impl Future<Output = CoreResult<()>> + Send;
}

/// Leader lease storage (durable backends only in multi-instance setups;
/// the memory backend implements a single-process lease for tests).
pub trait LeaseStore: Send + Sync {
    /// Attempt to take the lease. Succeeds when the row is absent, expired,
    /// or already held by this instance.
    fn try_acquire(
        &self,
        instance_id: &str,
        ttl: Duration,
    ) -> impl Future<Output = CoreResult<AcquireOutcome>> + Send;

    /// Extend the lease. Returns `Lost` if this instance no longer holds it.
    fn renew(
        &self,
        instance_id: &str,
        ttl: Duration,
    ) -> impl Future<Output = CoreResult<RenewOutcome>> + Send;

    /// Give up the lease if held by this instance. Idempotent.
    fn release(&self, instance_id: &str) -> impl Future<Output = CoreResult<()>> + Send;
}

/// API key storage.
pub trait ApiKeyStore: Send + Sync {
    fn insert_api_key(&self, key: &ApiKey) -> impl Future<Output = CoreResult<()>> + Send;

    /// Look up a key record by the SHA-256 hash of the presented secret.
    fn get_api_key_by_hash(
        &self,
        key_hash: &str,
    ) -> impl Future<Output = CoreResult<Option<ApiKey>>> + Send;

    fn list_api_keys(&self) -> impl Future<Output = CoreResult<Vec<ApiKey>>> + Send;
}

/// The composed storage surface the runner needs.
pub trait Backend: RunStore + CheckpointStore + ScheduleStore + ApiKeyStore {}

impl<T: RunStore + CheckpointStore + ScheduleStore + ApiKeyStore> Backend for T {}

// ---------------------------------------------------------------------------
// Transient-error retry
// ---------------------------------------------------------------------------

/// Backoff schedule applied to `Transient` storage errors at step
/// boundaries.
pub const BACKOFF_DELAYS: [Duration; 3] = [
    Duration::from_millis(50),
    Duration::from_millis(200),
    Duration::from_millis(800),
];

/// Run `op`, retrying `Transient` failures up to three times with
/// exponential backoff. Any other error kind is returned immediately.
pub async fn with_backoff<T, F, Fut>(mut op: F) -> CoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CoreResult<T>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < BACKOFF_DELAYS.len() => {
                tracing::debug!(
                    attempt,
                    delay_ms = BACKOFF_DELAYS[attempt].as_millis() as u64,
                    error = %e,
                    "retrying transient backend error"
                );
                tokio::time::sleep(BACKOFF_DELAYS[attempt]).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::error::CoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_with_backoff_retries_transient_then_succeeds() {
        let calls = AtomicUsize::new(0);
        let result = with_backoff(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CoreError::transient("flaky io"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_backoff_gives_up_after_three_retries() {
        let calls = AtomicUsize::new(0);
        let result: CoreResult<()> = with_backoff(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::transient("still down")) }
        })
        .await;
        assert!(result.is_err());
        // Initial attempt plus one per backoff delay.
        assert_eq!(calls.load(Ordering::SeqCst), 1 + BACKOFF_DELAYS.len());
    }

    #[tokio::test]
    async fn test_with_backoff_does_not_retry_fatal() {
        let calls = AtomicUsize::new(0);
        let result: CoreResult<()> = with_backoff(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::fatal("schema mismatch")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
