//! Leader election over a lease row.
//!
//! Every `renew_interval` the elector either tries to acquire the lease
//! (follower) or renews it (leader). Transitions are serialised inside the
//! election loop; callbacks are invoked synchronously from it.
//!
//! At most one instance observes itself as leader at any wall-clock
//! instant, assuming monotonic clocks and a linearizable lease row. Clock
//! skew beyond the TTL can produce split leadership; callers needing
//! stronger guarantees must layer their own fencing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use conductor_types::lease::{AcquireOutcome, RenewOutcome};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::LeaseStore;

/// Default interval between acquire/renew attempts.
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(2);

/// Default lease TTL.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(10);

type LeadershipCallback = Box<dyn Fn(bool) + Send + Sync>;

/// At-most-one leader across instances via a TTL'd lease row.
pub struct LeaderElector<L: LeaseStore + 'static> {
    store: Arc<L>,
    instance_id: String,
    ttl: Duration,
    renew_interval: Duration,
    is_leader: Arc<AtomicBool>,
    callbacks: Arc<std::sync::Mutex<Vec<LeadershipCallback>>>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl<L: LeaseStore + 'static> LeaderElector<L> {
    pub fn new(store: Arc<L>, instance_id: String) -> Self {
        Self::with_timing(store, instance_id, DEFAULT_LEASE_TTL, DEFAULT_RENEW_INTERVAL)
    }

    pub fn with_timing(
        store: Arc<L>,
        instance_id: String,
        ttl: Duration,
        renew_interval: Duration,
    ) -> Self {
        Self {
            store,
            instance_id,
            ttl,
            renew_interval,
            is_leader: Arc::new(AtomicBool::new(false)),
            callbacks: Arc::new(std::sync::Mutex::new(Vec::new())),
            task: Mutex::new(None),
        }
    }

    /// Register a callback invoked on every leadership transition.
    /// Register before `start`; callbacks run synchronously in the
    /// election loop.
    pub fn on_leadership_change(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        self.callbacks
            .lock()
            .expect("callbacks lock")
            .push(Box::new(callback));
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Start the election loop. Idempotent.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(election_loop(
            Arc::clone(&self.store),
            self.instance_id.clone(),
            self.ttl,
            self.renew_interval,
            Arc::clone(&self.is_leader),
            Arc::clone(&self.callbacks),
            token.clone(),
        ));
        *task = Some((token, handle));
        tracing::info!(instance_id = self.instance_id.as_str(), "leader elector started");
    }

    /// Stop the loop and release the lease if held.
    pub async fn stop(&self) {
        let entry = self.task.lock().await.take();
        let Some((token, handle)) = entry else {
            return;
        };
        token.cancel();
        let _ = handle.await;

        if self.is_leader.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.store.release(&self.instance_id).await {
                tracing::warn!(error = %e, "lease release failed");
            }
            notify(&self.callbacks, false);
        }
        tracing::info!(instance_id = self.instance_id.as_str(), "leader elector stopped");
    }
}

fn notify(callbacks: &std::sync::Mutex<Vec<LeadershipCallback>>, leader: bool) {
    for callback in callbacks.lock().expect("callbacks lock").iter() {
        callback(leader);
    }
}

#[allow(clippy::too_many_arguments)]
async fn election_loop<L: LeaseStore>(
    store: Arc<L>,
    instance_id: String,
    ttl: Duration,
    renew_interval: Duration,
    is_leader: Arc<AtomicBool>,
    callbacks: Arc<std::sync::Mutex<Vec<LeadershipCallback>>>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(renew_interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if is_leader.load(Ordering::SeqCst) {
            match store.renew(&instance_id, ttl).await {
                Ok(RenewOutcome::Renewed) => {}
                Ok(RenewOutcome::Lost) => {
                    tracing::warn!(instance_id = instance_id.as_str(), "leadership lost");
                    is_leader.store(false, Ordering::SeqCst);
                    notify(&callbacks, false);
                }
                Err(e) => {
                    // Keep leadership until the TTL decides; the next tick
                    // retries.
                    tracing::warn!(error = %e, "lease renewal error");
                }
            }
        } else {
            match store.try_acquire(&instance_id, ttl).await {
                Ok(AcquireOutcome::Acquired(_)) => {
                    tracing::info!(instance_id = instance_id.as_str(), "leadership acquired");
                    is_leader.store(true, Ordering::SeqCst);
                    notify(&callbacks, true);
                }
                Ok(AcquireOutcome::HeldByOther { holder_instance_id }) => {
                    tracing::trace!(
                        holder = holder_instance_id.as_str(),
                        "lease held by another instance"
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "lease acquisition error");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use std::sync::atomic::AtomicUsize;

    fn fast_elector(store: Arc<MemoryBackend>, id: &str) -> LeaderElector<MemoryBackend> {
        LeaderElector::with_timing(
            store,
            id.to_string(),
            Duration::from_millis(200),
            Duration::from_millis(20),
        )
    }

    #[tokio::test]
    async fn test_single_instance_becomes_leader() {
        let store = Arc::new(MemoryBackend::new());
        let elector = fast_elector(store, "node-a");
        elector.start().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(elector.is_leader());
        elector.stop().await;
        assert!(!elector.is_leader());
    }

    #[tokio::test]
    async fn test_at_most_one_leader() {
        let store = Arc::new(MemoryBackend::new());
        let a = fast_elector(Arc::clone(&store), "node-a");
        let b = fast_elector(Arc::clone(&store), "node-b");
        a.start().await;
        b.start().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        for _ in 0..10 {
            assert!(
                !(a.is_leader() && b.is_leader()),
                "both instances report leadership"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(a.is_leader() || b.is_leader());

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_follower_takes_over_after_release() {
        let store = Arc::new(MemoryBackend::new());
        let a = fast_elector(Arc::clone(&store), "node-a");
        let b = fast_elector(Arc::clone(&store), "node-b");
        a.start().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(a.is_leader());

        b.start().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!b.is_leader());

        // Stopping the leader releases the lease; the follower takes over.
        a.stop().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(b.is_leader());
        b.stop().await;
    }

    #[tokio::test]
    async fn test_callbacks_fire_on_transitions() {
        let store = Arc::new(MemoryBackend::new());
        let elector = fast_elector(store, "node-a");
        let gained = Arc::new(AtomicUsize::new(0));
        let lost = Arc::new(AtomicUsize::new(0));
        {
            let gained = Arc::clone(&gained);
            let lost = Arc::clone(&lost);
            elector.on_leadership_change(move |leader| {
                if leader {
                    gained.fetch_add(1, Ordering::SeqCst);
                } else {
                    lost.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        elector.start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        elector.stop().await;

        assert_eq!(gained.load(Ordering::SeqCst), 1);
        assert_eq!(lost.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let store = Arc::new(MemoryBackend::new());
        let elector = fast_elector(store, "node-a");
        elector.start().await;
        elector.start().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(elector.is_leader());
        elector.stop().await;
        elector.stop().await;
    }
}
