//! Subscriber registry with snapshot broadcast semantics.
//!
//! The registry keeps its entries in a copy-on-write list: `subscribe` and
//! removals swap in a new list under a short write lock, while `broadcast`
//! clones the current `Arc` and iterates it without holding any lock. Each
//! entry guards its own state and sender, so a delivery and a concurrent
//! removal of the same subscriber never interleave halfway.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use clpmonitor_common::BroadcastEvent;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::Stream;
use tracing::{debug, trace};

use crate::health::JobObserver;

/// Identifier assigned to a subscriber at creation.
pub type SubscriberId = u64;

/// Lifecycle of a subscriber.
///
/// `Created -> Active -> {Completed | TimedOut | Errored}`. Terminal states
/// are final; a subscriber in one never receives another delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberState {
    Created,
    Active,
    /// Observer went away or the engine stopped.
    Completed,
    /// Subscription outlived its time-to-live.
    TimedOut,
    /// A delivery failed: queue full or observer gone.
    Errored,
}

impl SubscriberState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriberState::Completed | SubscriberState::TimedOut | SubscriberState::Errored
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriberState::Created => "created",
            SubscriberState::Active => "active",
            SubscriberState::Completed => "completed",
            SubscriberState::TimedOut => "timed_out",
            SubscriberState::Errored => "errored",
        }
    }
}

impl std::fmt::Display for SubscriberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Slot {
    state: SubscriberState,
    sender: Option<mpsc::Sender<BroadcastEvent>>,
}

#[derive(Debug)]
struct Entry {
    id: SubscriberId,
    created: Instant,
    slot: Mutex<Slot>,
}

enum Delivery {
    Sent,
    Skipped,
    Failed(SubscriberState),
}

impl Entry {
    fn state(&self) -> SubscriberState {
        self.slot.lock().state
    }

    /// Move to a terminal state and release the sender. No-op when already terminal.
    fn finish(&self, state: SubscriberState) -> SubscriberState {
        let mut slot = self.slot.lock();
        if !slot.state.is_terminal() {
            slot.state = state;
            slot.sender = None;
        }
        slot.state
    }

    fn deliver(&self, event: &BroadcastEvent, ttl: Option<Duration>) -> Delivery {
        let mut slot = self.slot.lock();
        if slot.state != SubscriberState::Active {
            return Delivery::Skipped;
        }
        let Some(sender) = slot.sender.as_ref() else {
            return Delivery::Skipped;
        };

        let outcome = if ttl.is_some_and(|ttl| self.created.elapsed() >= ttl) {
            SubscriberState::TimedOut
        } else {
            match sender.try_send(event.clone()) {
                Ok(()) => return Delivery::Sent,
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                    SubscriberState::Errored
                }
            }
        };

        slot.state = outcome;
        slot.sender = None;
        Delivery::Failed(outcome)
    }
}

struct Inner {
    entries: RwLock<Arc<Vec<Arc<Entry>>>>,
    /// Set by `close_all`, only while holding the `entries` write lock.
    closed: AtomicBool,
    next_id: AtomicU64,
    buffer: usize,
    ttl: Option<Duration>,
    observer: Arc<dyn JobObserver>,
}

impl Inner {
    fn snapshot(&self) -> Arc<Vec<Arc<Entry>>> {
        self.entries.read().clone()
    }

    fn remove(&self, id: SubscriberId, reason: SubscriberState) -> bool {
        let removed = {
            let mut entries = self.entries.write();
            let Some(pos) = entries.iter().position(|e| e.id == id) else {
                return false;
            };
            let mut next = Vec::clone(&entries);
            let entry = next.remove(pos);
            *entries = Arc::new(next);
            entry
        };

        let state = removed.finish(reason);
        debug!(subscriber = id, reason = %state, "Subscriber removed");
        self.observer.subscriber_removed(id, state);
        true
    }
}

/// Concurrency-safe set of live subscribers.
///
/// Cloning yields another handle to the same set.
#[derive(Clone)]
pub struct SubscriberRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("subscribers", &self.len())
            .field("buffer", &self.inner.buffer)
            .field("ttl", &self.inner.ttl)
            .finish()
    }
}

impl SubscriberRegistry {
    /// Create a registry whose subscribers queue up to `buffer` events.
    ///
    /// With a `ttl`, a subscriber older than it is timed out at its next
    /// delivery attempt.
    pub fn new(buffer: usize, ttl: Option<Duration>, observer: Arc<dyn JobObserver>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(Arc::new(Vec::new())),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
                ttl,
                observer,
            }),
        }
    }

    /// Register a new subscriber. It is `Active` on return.
    ///
    /// Once the registry is closed the subscriber comes back already
    /// `Completed`, and its stream ends immediately.
    pub fn subscribe(&self) -> Subscriber {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.inner.buffer);
        let entry = Arc::new(Entry {
            id,
            created: Instant::now(),
            slot: Mutex::new(Slot {
                state: SubscriberState::Created,
                sender: Some(sender),
            }),
        });

        let registered = {
            let mut entries = self.inner.entries.write();
            if self.inner.closed.load(Ordering::SeqCst) {
                false
            } else {
                let mut next = Vec::clone(&entries);
                next.push(entry.clone());
                *entries = Arc::new(next);
                true
            }
        };

        if registered {
            // A concurrent close_all may already have completed it
            let mut slot = entry.slot.lock();
            if slot.state == SubscriberState::Created {
                slot.state = SubscriberState::Active;
            }
            debug!(subscriber = id, "Subscriber added");
        } else {
            entry.finish(SubscriberState::Completed);
            debug!(subscriber = id, "Registry closed, subscriber completed");
        }

        Subscriber {
            entry,
            receiver,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a subscriber, recording `reason` as its final state.
    ///
    /// Returns false when the subscriber was already removed.
    pub fn unsubscribe(&self, id: SubscriberId, reason: SubscriberState) -> bool {
        self.inner.remove(id, reason)
    }

    /// Deliver `event` to every subscriber registered when the call starts.
    ///
    /// Delivery never waits: a subscriber whose queue is full or whose
    /// observer is gone is removed as `Errored`. Returns the number of
    /// subscribers that received the event.
    pub fn broadcast(&self, event: &BroadcastEvent) -> usize {
        let snapshot = self.inner.snapshot();
        let mut delivered = 0;
        let mut failed = Vec::new();

        for entry in snapshot.iter() {
            match entry.deliver(event, self.inner.ttl) {
                Delivery::Sent => delivered += 1,
                Delivery::Skipped => {}
                Delivery::Failed(reason) => failed.push((entry.id, reason)),
            }
        }

        for (id, reason) in failed {
            self.inner.remove(id, reason);
        }

        trace!(event = %event.name, delivered, "Broadcast");
        delivered
    }

    /// Complete and remove every subscriber, and refuse new ones from now on.
    pub fn close_all(&self) -> usize {
        let entries = {
            let mut entries = self.inner.entries.write();
            self.inner.closed.store(true, Ordering::SeqCst);
            std::mem::replace(&mut *entries, Arc::new(Vec::new()))
        };
        for entry in entries.iter() {
            let state = entry.finish(SubscriberState::Completed);
            self.inner.observer.subscriber_removed(entry.id, state);
        }
        entries.len()
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`close_all`](Self::close_all) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Ids of the registered subscribers, in subscription order.
    pub fn ids(&self) -> Vec<SubscriberId> {
        self.inner.snapshot().iter().map(|e| e.id).collect()
    }
}

/// Receiving end of one subscription.
///
/// Dropping it unsubscribes with [`SubscriberState::Completed`]. Once the
/// subscriber is removed for any reason, the queue drains and then the
/// stream ends.
#[derive(Debug)]
pub struct Subscriber {
    entry: Arc<Entry>,
    receiver: mpsc::Receiver<BroadcastEvent>,
    registry: Weak<Inner>,
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        self.entry.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriberState {
        self.entry.state()
    }

    /// Next event, or `None` once removed and drained.
    pub async fn recv(&mut self) -> Option<BroadcastEvent> {
        self.receiver.recv().await
    }

    /// Next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<BroadcastEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for Subscriber {
    type Item = BroadcastEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.remove(self.entry.id, SubscriberState::Completed);
        }
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner").field("buffer", &self.buffer).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::EngineHealth;

    fn registry(buffer: usize) -> SubscriberRegistry {
        SubscriberRegistry::new(buffer, None, Arc::new(EngineHealth::new()))
    }

    fn event(n: i64) -> BroadcastEvent {
        BroadcastEvent::scalar("metric", 2, n)
    }

    #[test]
    fn test_subscribe_is_active() {
        let registry = registry(4);
        let sub = registry.subscribe();
        assert_eq!(sub.state(), SubscriberState::Active);
        assert_eq!(registry.ids(), vec![sub.id()]);
    }

    #[test]
    fn test_fan_out_one_copy_each() {
        let registry = registry(4);
        let mut subs: Vec<_> = (0..5).map(|_| registry.subscribe()).collect();

        assert_eq!(registry.broadcast(&event(7)), 5);
        for sub in &mut subs {
            assert_eq!(sub.try_recv(), Some(event(7)));
            assert_eq!(sub.try_recv(), None);
        }
    }

    #[test]
    fn test_failed_sink_excluded_from_next_broadcast() {
        let registry = registry(4);
        let mut live: Vec<_> = (0..3).map(|_| registry.subscribe()).collect();
        let mut dead = registry.subscribe();
        // Observer gone while the subscription is still registered
        dead.receiver.close();

        assert_eq!(registry.broadcast(&event(1)), 3);
        assert_eq!(dead.state(), SubscriberState::Errored);
        assert!(!registry.ids().contains(&dead.id()));

        assert_eq!(registry.broadcast(&event(2)), 3);
        for sub in &mut live {
            assert_eq!(sub.try_recv(), Some(event(1)));
            assert_eq!(sub.try_recv(), Some(event(2)));
        }
    }

    #[test]
    fn test_full_queue_is_delivery_failure() {
        let registry = registry(1);
        let slow = registry.subscribe();
        let mut fast = registry.subscribe();

        assert_eq!(registry.broadcast(&event(1)), 2);
        assert_eq!(fast.try_recv(), Some(event(1)));

        assert_eq!(registry.broadcast(&event(2)), 1);
        assert_eq!(slow.state(), SubscriberState::Errored);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_drop_completes() {
        let registry = registry(4);
        let sub = registry.subscribe();
        let keep = registry.subscribe();
        drop(sub);

        assert_eq!(registry.ids(), vec![keep.id()]);
    }

    #[test]
    fn test_unsubscribe_twice() {
        let registry = registry(4);
        let sub = registry.subscribe();

        assert!(registry.unsubscribe(sub.id(), SubscriberState::Completed));
        assert!(!registry.unsubscribe(sub.id(), SubscriberState::Errored));
        assert_eq!(sub.state(), SubscriberState::Completed);
        assert_eq!(registry.broadcast(&event(1)), 0);
    }

    #[test]
    fn test_ttl_times_out() {
        let registry =
            SubscriberRegistry::new(4, Some(Duration::ZERO), Arc::new(EngineHealth::new()));
        let mut sub = registry.subscribe();

        assert_eq!(registry.broadcast(&event(1)), 0);
        assert_eq!(sub.state(), SubscriberState::TimedOut);
        assert!(registry.is_empty());
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn test_close_all_ends_streams() {
        let registry = registry(4);
        let mut sub = registry.subscribe();
        registry.broadcast(&event(1));

        assert_eq!(registry.close_all(), 1);
        assert_eq!(sub.state(), SubscriberState::Completed);
        assert_eq!(sub.recv().await, Some(event(1)));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_subscribe_after_close_ends_immediately() {
        let registry = registry(4);
        registry.close_all();
        assert!(registry.is_closed());

        let mut late = registry.subscribe();

        assert_eq!(late.state(), SubscriberState::Completed);
        assert!(registry.is_empty());
        assert_eq!(registry.broadcast(&event(1)), 0);
        assert_eq!(late.recv().await, None);
    }

    #[test]
    fn test_subscribe_during_broadcast_sees_snapshot() {
        let registry = registry(4);
        let mut early = registry.subscribe();
        let snapshot = registry.inner.snapshot();

        // Joins after the snapshot was taken
        let mut late = registry.subscribe();
        for entry in snapshot.iter() {
            assert!(matches!(entry.deliver(&event(1), None), Delivery::Sent));
        }

        assert_eq!(snapshot.len(), 1);
        assert_eq!(early.try_recv(), Some(event(1)));
        assert_eq!(late.try_recv(), None);

        assert_eq!(registry.broadcast(&event(2)), 2);
        assert_eq!(late.try_recv(), Some(event(2)));
    }

    #[test]
    fn test_per_subscriber_order() {
        let registry = registry(16);
        let mut sub = registry.subscribe();
        for i in 0..10 {
            registry.broadcast(&event(i));
        }
        let received: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert_eq!(received, (0..10).map(event).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_concurrent_subscribe_and_broadcast() {
        let registry = registry(256);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let mut sub = registry.subscribe();
                for i in 0..50 {
                    registry.broadcast(&event(i));
                    tokio::task::yield_now().await;
                }
                // Every broadcast made after subscribing reached this subscriber
                let received = std::iter::from_fn(|| sub.try_recv()).count();
                assert!(received >= 50, "received {received}");
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(registry.is_empty());
    }
}
