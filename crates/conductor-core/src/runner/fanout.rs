//! Per-run log/event fan-out.
//!
//! One producer (the dispatcher that owns the run) and many consumers.
//! Each subscriber has its own bounded ring buffer: when it falls behind,
//! its oldest entries are dropped so the producer never blocks. A bounded
//! recent-event ring per run serves `Last-Event-ID` replay.
//!
//! Sequence numbers are strictly increasing per run, starting at 1.
//! Channel close (terminal state) is observed by subscribers only after
//! every previously published event has been drained.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use conductor_types::event::{EventKind, EventLevel, RunEvent};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// Subscriber side
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SubscriberShared {
    buffer: Mutex<VecDeque<RunEvent>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl SubscriberShared {
    fn push(&self, event: RunEvent) {
        {
            let mut buffer = self.buffer.lock().expect("subscriber buffer lock");
            if buffer.len() >= self.capacity {
                buffer.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buffer.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// A handle to one subscriber's event stream. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    shared: Arc<SubscriberShared>,
}

impl Subscription {
    /// Receive the next event, or `None` once the run is terminal and the
    /// buffer is drained.
    pub async fn recv(&mut self) -> Option<RunEvent> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.shared.closed.load(Ordering::SeqCst) {
                // Re-check: an event may have landed between the pop and
                // the closed read.
                match self.try_recv() {
                    Some(event) => return Some(event),
                    None => return None,
                }
            }
            notified.await;
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<RunEvent> {
        self.shared
            .buffer
            .lock()
            .expect("subscriber buffer lock")
            .pop_front()
    }

    /// How many events this subscriber has dropped by falling behind.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Per-run channel
// ---------------------------------------------------------------------------

struct ChannelState {
    next_seq: u64,
    recent: VecDeque<RunEvent>,
    subscribers: Vec<Arc<SubscriberShared>>,
    closed: bool,
}

struct RunChannel {
    state: Mutex<ChannelState>,
    recent_capacity: usize,
}

impl RunChannel {
    fn new(start_seq: u64, recent_capacity: usize) -> Self {
        Self {
            state: Mutex::new(ChannelState {
                next_seq: start_seq,
                recent: VecDeque::new(),
                subscribers: Vec::new(),
                closed: false,
            }),
            recent_capacity,
        }
    }

    fn publish(&self, level: EventLevel, kind: EventKind, payload: Value) -> u64 {
        let mut state = self.state.lock().expect("channel lock");
        let sequence = state.next_seq;
        state.next_seq += 1;
        let event = RunEvent {
            sequence,
            timestamp: Utc::now(),
            level,
            kind,
            payload,
        };

        state.recent.push_back(event.clone());
        if state.recent.len() > self.recent_capacity {
            state.recent.pop_front();
        }

        // Prune subscribers whose handles were dropped.
        state.subscribers.retain(|sub| Arc::strong_count(sub) > 1);
        for sub in &state.subscribers {
            sub.push(event.clone());
        }
        sequence
    }

    fn subscribe_after(&self, last_seq: u64, capacity: usize) -> Subscription {
        let shared = Arc::new(SubscriberShared {
            buffer: Mutex::new(VecDeque::new()),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });

        let mut state = self.state.lock().expect("channel lock");
        for event in state.recent.iter().filter(|e| e.sequence > last_seq) {
            shared.push(event.clone());
        }
        if state.closed {
            shared.close();
        } else {
            state.subscribers.push(Arc::clone(&shared));
        }
        Subscription { shared }
    }

    fn close(&self) {
        let mut state = self.state.lock().expect("channel lock");
        state.closed = true;
        for sub in state.subscribers.drain(..) {
            sub.close();
        }
    }

    fn current_seq(&self) -> u64 {
        self.state.lock().expect("channel lock").next_seq - 1
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// Registry of per-run channels.
pub struct LogHub {
    channels: DashMap<String, Arc<RunChannel>>,
    recent_capacity: usize,
    subscriber_capacity: usize,
}

impl LogHub {
    pub fn new(recent_capacity: usize, subscriber_capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            recent_capacity,
            subscriber_capacity,
        }
    }

    /// Create the channel for a run if absent. `start_seq` seeds the
    /// sequence counter (used on resume so numbering continues across
    /// instances).
    pub fn ensure_channel(&self, run_id: &str, start_seq: u64) {
        self.channels
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(RunChannel::new(start_seq.max(1), self.recent_capacity)));
    }

    /// Publish an event; returns its sequence number.
    ///
    /// The channel is created on demand so triggers can log before the
    /// dispatcher starts.
    pub fn publish(
        &self,
        run_id: &str,
        level: EventLevel,
        kind: EventKind,
        payload: Value,
    ) -> u64 {
        let channel = self
            .channels
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(RunChannel::new(1, self.recent_capacity)))
            .clone();
        channel.publish(level, kind, payload)
    }

    /// Subscribe, replaying buffered events with sequence > `last_seq`.
    /// Returns `None` when the run has no channel (unknown run).
    pub fn subscribe_after(&self, run_id: &str, last_seq: u64) -> Option<Subscription> {
        let channel = self.channels.get(run_id)?.clone();
        Some(channel.subscribe_after(last_seq, self.subscriber_capacity))
    }

    /// Subscribe to live events only.
    pub fn subscribe_live(&self, run_id: &str) -> Option<Subscription> {
        let channel = self.channels.get(run_id)?.clone();
        let from = channel.current_seq();
        Some(channel.subscribe_after(from, self.subscriber_capacity))
    }

    /// Highest sequence published so far (0 when none).
    pub fn current_seq(&self, run_id: &str) -> u64 {
        self.channels
            .get(run_id)
            .map(|ch| ch.current_seq())
            .unwrap_or(0)
    }

    /// Close a run's channel. Subscribers see `None` after draining.
    /// The channel is retained so late subscribers can still replay the
    /// recent-event ring.
    pub fn close(&self, run_id: &str) {
        if let Some(channel) = self.channels.get(run_id) {
            channel.close();
        }
    }

    /// Drop a run's channel entirely (run deletion).
    pub fn remove(&self, run_id: &str) {
        if let Some((_, channel)) = self.channels.remove(run_id) {
            channel.close();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hub() -> LogHub {
        LogHub::new(1024, 8)
    }

    #[tokio::test]
    async fn test_sequences_start_at_one_and_increase() {
        let hub = hub();
        hub.ensure_channel("r1", 1);
        assert_eq!(hub.publish("r1", EventLevel::Info, EventKind::Status, json!("pending")), 1);
        assert_eq!(hub.publish("r1", EventLevel::Info, EventKind::Log, json!("x")), 2);
        assert_eq!(hub.publish("r1", EventLevel::Info, EventKind::Log, json!("y")), 3);
        assert_eq!(hub.current_seq("r1"), 3);
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order_without_gaps() {
        let hub = hub();
        hub.ensure_channel("r1", 1);
        let mut sub = hub.subscribe_after("r1", 0).unwrap();

        for i in 0..5 {
            hub.publish("r1", EventLevel::Info, EventKind::Log, json!(i));
        }
        hub.close("r1");

        let mut seqs = Vec::new();
        while let Some(event) = sub.recv().await {
            seqs.push(event.sequence);
        }
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_replay_from_last_event_id() {
        let hub = hub();
        hub.ensure_channel("r1", 1);
        for i in 0..4 {
            hub.publish("r1", EventLevel::Info, EventKind::Log, json!(i));
        }

        let mut sub = hub.subscribe_after("r1", 2).unwrap();
        assert_eq!(sub.try_recv().unwrap().sequence, 3);
        assert_eq!(sub.try_recv().unwrap().sequence, 4);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let hub = LogHub::new(1024, 3);
        hub.ensure_channel("r1", 1);
        let mut sub = hub.subscribe_after("r1", 0).unwrap();

        for i in 0..10 {
            hub.publish("r1", EventLevel::Info, EventKind::Log, json!(i));
        }

        // Only the newest 3 remain; the oldest were dropped.
        assert_eq!(sub.dropped(), 7);
        assert_eq!(sub.try_recv().unwrap().sequence, 8);
        assert_eq!(sub.try_recv().unwrap().sequence, 9);
        assert_eq!(sub.try_recv().unwrap().sequence, 10);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_late_subscriber_on_closed_channel_gets_replay_then_none() {
        let hub = hub();
        hub.ensure_channel("r1", 1);
        hub.publish("r1", EventLevel::Info, EventKind::Status, json!("completed"));
        hub.close("r1");

        let mut sub = hub.subscribe_after("r1", 0).unwrap();
        let first = sub.recv().await.unwrap();
        assert_eq!(first.sequence, 1);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_run_has_no_channel() {
        let hub = hub();
        assert!(hub.subscribe_after("missing", 0).is_none());
        assert_eq!(hub.current_seq("missing"), 0);
    }

    #[tokio::test]
    async fn test_resume_seeds_sequence_counter() {
        let hub = hub();
        hub.ensure_channel("r1", 42);
        let seq = hub.publish("r1", EventLevel::Info, EventKind::Status, json!("running"));
        assert_eq!(seq, 42);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_get_all_events() {
        let hub = hub();
        hub.ensure_channel("r1", 1);
        let mut a = hub.subscribe_after("r1", 0).unwrap();
        let mut b = hub.subscribe_after("r1", 0).unwrap();

        hub.publish("r1", EventLevel::Info, EventKind::Log, json!("x"));
        hub.close("r1");

        assert_eq!(a.recv().await.unwrap().sequence, 1);
        assert_eq!(b.recv().await.unwrap().sequence, 1);
        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let hub = Arc::new(hub());
        hub.ensure_channel("r1", 1);
        let mut sub = hub.subscribe_after("r1", 0).unwrap();

        let publisher = Arc::clone(&hub);
        let task = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            publisher.publish("r1", EventLevel::Info, EventKind::Log, json!("late"));
        });

        let event = sub.recv().await.unwrap();
        assert_eq!(event.payload, json!("late"));
        task.await.unwrap();
    }
}
