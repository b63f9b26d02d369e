//! Admission queue for submitted runs.
//!
//! Jobs wait in FIFO order with higher-priority jobs jumping ahead:
//! ordering is (priority descending, submission sequence ascending). The
//! dispatcher acquires a concurrency permit first and then pops the
//! highest-priority job, so priority is honored at dispatch time.

use std::collections::BinaryHeap;
use std::sync::Mutex;

use conductor_types::error::{CoreError, CoreResult};
use serde_json::Value;
use tokio::sync::Notify;

/// A run waiting for admission.
#[derive(Debug)]
pub struct QueuedJob {
    pub run_id: String,
    pub priority: i32,
    /// Monotonic submission order, used as the FIFO tiebreaker.
    pub seq: u64,
    /// First step index to execute (non-zero on resume).
    pub start_index: u32,
    /// Context re-hydrated from a checkpoint on resume.
    pub context: Option<Value>,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then lower seq (earlier submit).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    heap: BinaryHeap<QueuedJob>,
    closed: bool,
}

/// Bounded (optionally) priority admission queue.
pub struct AdmissionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: Option<usize>,
}

impl AdmissionQueue {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue a job. Fails with `CapacityExhausted` when bounded and full.
    pub fn push(&self, job: QueuedJob) -> CoreResult<()> {
        {
            let mut state = self.state.lock().expect("queue lock");
            if state.closed {
                return Err(CoreError::draining("admission queue closed"));
            }
            if let Some(capacity) = self.capacity {
                if state.heap.len() >= capacity {
                    return Err(CoreError::capacity(format!(
                        "admission queue full ({capacity} jobs)"
                    )));
                }
            }
            state.heap.push(job);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the highest-priority job, waiting if empty. Returns `None` once
    /// the queue is closed and drained.
    pub async fn pop(&self) -> Option<QueuedJob> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("queue lock");
                if let Some(job) = state.heap.pop() {
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the queue; `pop` returns `None` once drained.
    pub fn close(&self) {
        self.state.lock().expect("queue lock").closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock").heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
