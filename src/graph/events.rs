//! Typed event subscriber lists for slot notifications.
//!
//! Every slot transition (dirty, ready, metadata change, structural change)
//! is delivered through an explicit [`SubscriberList`] with a strongly-typed
//! payload. Handlers run synchronously at the point of the transition, on
//! the thread that raised it; the list is snapshotted before invocation so
//! a handler may re-enter the graph (subscribe, resize, read) without
//! deadlocking on the list's own lock.

use crate::core::metadata::SlotMeta;
use crate::core::roi::Roi;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle returned from [`SubscriberList::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// An ordered list of typed event subscribers.
pub struct SubscriberList<T> {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, Subscriber<T>)>>,
}

impl<T> SubscriberList<T> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback; returns a handle for unsubscription.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, Arc::new(callback)));
        SubscriptionId(id)
    }

    /// Remove a previously registered callback. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.lock();
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id.0);
        subs.len() != before
    }

    /// Deliver an event to every subscriber, in subscription order.
    pub fn emit(&self, event: &T) {
        // Snapshot under the lock, call outside it.
        let snapshot: Vec<Subscriber<T>> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in snapshot {
            cb(event);
        }
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Whether no subscribers are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for SubscriberList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for SubscriberList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberList")
            .field("subscribers", &self.len())
            .finish()
    }
}

/// A sub-region of a slot became stale.
#[derive(Debug, Clone)]
pub struct DirtyEvent {
    /// The stale region, in the slot's own coordinates.
    pub roi: Roi,
}

/// A slot's metadata changed.
#[derive(Debug, Clone)]
pub struct MetaEvent {
    /// The new metadata.
    pub meta: SlotMeta,
}

/// A sub-slot was inserted into or removed from a level-1 slot.
#[derive(Debug, Clone, Copy)]
pub struct LaneEvent {
    /// Index of the inserted/removed sub-slot.
    pub index: usize,
    /// List length after the change.
    pub size: usize,
}

/// A level-1 slot's length changed.
#[derive(Debug, Clone, Copy)]
pub struct ResizeEvent {
    /// List length after the change.
    pub size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_subscribe_emit_unsubscribe() {
        let list: SubscriberList<DirtyEvent> = SubscriberList::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count2 = count.clone();
        let id = list.subscribe(move |_| {
            count2.fetch_add(1, Ordering::Relaxed);
        });

        let event = DirtyEvent {
            roi: Roi::new(vec![0], vec![5]),
        };
        list.emit(&event);
        assert_eq!(count.load(Ordering::Relaxed), 1);

        assert!(list.unsubscribe(id));
        list.emit(&event);
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert!(!list.unsubscribe(id));
    }

    #[test]
    fn test_emit_order_is_subscription_order() {
        let list: SubscriberList<ResizeEvent> = SubscriberList::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3 {
            let order2 = order.clone();
            list.subscribe(move |_| order2.lock().push(tag));
        }

        list.emit(&ResizeEvent { size: 1 });
        assert_eq!(&*order.lock(), &[0, 1, 2]);
    }

    #[test]
    fn test_reentrant_subscribe_during_emit() {
        let list: Arc<SubscriberList<ResizeEvent>> = Arc::new(SubscriberList::new());
        let list2 = list.clone();
        list.subscribe(move |_| {
            // Must not deadlock.
            list2.subscribe(|_| {});
        });
        list.emit(&ResizeEvent { size: 0 });
        assert_eq!(list.len(), 2);
    }
}
