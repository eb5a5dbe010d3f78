//! Notification bus (§4.J): type-indexed synchronous and asynchronous event
//! delivery to consumers, with a bounded per-subscriber queue for the async
//! side.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Core-wide events a consumer (chat UI, CLI, internal task) may subscribe
/// to. Kept as one flat enum per §9's "prefer compile-time enumeration to
/// reflection" design note; each variant corresponds to a row in §6/§8.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    Connectivity { connected: bool },
    KxCompleted { peer: [u8; 32] },
    KxTimedOut { peer: [u8; 32] },
    KxAborted { peer: [u8; 32], reason: String },
    RatchetDesync { peer: [u8; 32] },
    OutboxFailed { peer: [u8; 32], reason: String },
    GcGenerationAdvanced { gc_id: [u8; 32], generation: u64 },
    PaymentSettled { invoice: String },
    PaymentRejected { invoice: String, reason: String },
}

type SyncHandler = Box<dyn Fn(&CoreEvent) + Send + Sync>;

/// A per-subscriber bounded ring buffer. A plain `tokio::sync::mpsc::Sender`
/// cannot implement "drop oldest" on a full queue — `try_send` only ever
/// fails without removing anything, so the best it can do is drop the
/// *newest* event. This holds the queue on the publish side instead, so a
/// full buffer is handled by popping the front before pushing.
struct AsyncSubscriber {
    queue: parking_lot::Mutex<VecDeque<CoreEvent>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

/// The receiving half handed back from [`NotificationBus::subscribe_async`].
pub struct AsyncReceiver {
    subscriber: Arc<AsyncSubscriber>,
}

impl AsyncReceiver {
    /// Await the next event. Returns `None` only if the subscription has
    /// been dropped from under the bus, which cannot happen while this
    /// receiver itself is alive — callers select this against a shutdown
    /// signal rather than relying on a close signal.
    pub async fn recv(&mut self) -> Option<CoreEvent> {
        loop {
            if let Some(event) = self.subscriber.queue.lock().pop_front() {
                return Some(event);
            }
            self.subscriber.notify.notified().await;
        }
    }
}

/// Synchronous handlers run serially on the dispatcher's calling task and
/// must not block; async subscribers get a bounded per-subscriber queue and
/// drop the oldest message (not the newest) when it fills, so a slow
/// consumer sees a gap rather than stalling the bus.
#[derive(Default)]
pub struct NotificationBus {
    sync_handlers: RwLock<HashMap<u64, SyncHandler>>,
    async_subscribers: RwLock<HashMap<u64, Arc<AsyncSubscriber>>>,
    next_id: AtomicU64,
}

pub struct Subscription {
    id: u64,
    kind: SubscriptionKind,
}

enum SubscriptionKind {
    Sync,
    Async,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_sync(
        &self,
        handler: impl Fn(&CoreEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sync_handlers.write().insert(id, Box::new(handler));
        Subscription {
            id,
            kind: SubscriptionKind::Sync,
        }
    }

    /// Returns the receiving end of a bounded queue; messages beyond
    /// `capacity` in flight cause the oldest to be dropped and a counter to
    /// increment (retrievable via `dropped_count`).
    pub fn subscribe_async(&self, capacity: usize) -> (Subscription, AsyncReceiver) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(AsyncSubscriber {
            queue: parking_lot::Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        });
        self.async_subscribers.write().insert(id, subscriber.clone());
        (
            Subscription {
                id,
                kind: SubscriptionKind::Async,
            },
            AsyncReceiver { subscriber },
        )
    }

    pub fn unsubscribe(&self, sub: Subscription) {
        match sub.kind {
            SubscriptionKind::Sync => {
                self.sync_handlers.write().remove(&sub.id);
            }
            SubscriptionKind::Async => {
                self.async_subscribers.write().remove(&sub.id);
            }
        }
    }

    /// Fire `event` to every sync handler in turn, then attempt a
    /// non-blocking send to every async subscriber, dropping the oldest
    /// queued item on that subscriber if the channel is full.
    pub fn publish(&self, event: CoreEvent) {
        let handlers: Vec<_> = {
            let guard = self.sync_handlers.read();
            // Snapshot handler references by cloning the map's Arc-free
            // contents is not possible for `Box<dyn Fn>`, so hold the read
            // lock only for the duration of the serial dispatch loop — a
            // handler unregistered mid-publish still finishes its own call
            // (it's already been looked up) and is never invoked again.
            guard.keys().copied().collect()
        };
        for id in handlers {
            let guard = self.sync_handlers.read();
            if let Some(handler) = guard.get(&id) {
                let handler_ptr: &SyncHandler = handler;
                // Re-borrow to call while holding the lock; publish is not
                // reentrant-safe against a handler calling publish itself.
                handler_ptr(&event);
            }
        }

        let subs: Vec<_> = self.async_subscribers.read().values().cloned().collect();
        for sub in subs {
            let mut queue = sub.queue.lock();
            if queue.len() >= sub.capacity {
                queue.pop_front();
                sub.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event.clone());
            drop(queue);
            sub.notify.notify_one();
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.async_subscribers
            .read()
            .values()
            .map(|s| s.dropped.load(Ordering::Relaxed))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn sync_handler_receives_published_event() {
        let bus = NotificationBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let _sub = bus.subscribe_sync(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(CoreEvent::Connectivity { connected: true });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_future_delivery() {
        let bus = NotificationBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let sub = bus.subscribe_sync(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        bus.unsubscribe(sub);
        bus.publish(CoreEvent::Connectivity { connected: false });
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn async_subscriber_receives_event() {
        let bus = NotificationBus::new();
        let (_sub, mut rx) = bus.subscribe_async(4);
        bus.publish(CoreEvent::KxCompleted { peer: [1u8; 32] });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, CoreEvent::KxCompleted { .. }));
    }

    #[tokio::test]
    async fn full_async_queue_drops_oldest() {
        let bus = NotificationBus::new();
        let (_sub, mut rx) = bus.subscribe_async(1);
        bus.publish(CoreEvent::Connectivity { connected: true });
        bus.publish(CoreEvent::Connectivity { connected: false });
        assert_eq!(bus.dropped_count(), 1);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, CoreEvent::Connectivity { connected: false }));
    }
}
