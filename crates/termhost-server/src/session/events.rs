//! Fan-out of session events to transport subscribers.
//!
//! Each subscriber gets its own unbounded channel, so a slow reader never
//! drops events and per-session ordering is preserved. Events published while
//! nobody is subscribed are lost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use termhost_core::SessionEvent;
use tokio::sync::mpsc;
use tracing::debug;

/// Handle used to unsubscribe.
pub type SubscriptionId = u64;

/// Receiving half handed to a subscriber.
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

#[derive(Default)]
pub struct EventPublisher {
    subscribers: Mutex<HashMap<SubscriptionId, mpsc::UnboundedSender<SessionEvent>>>,
    next_id: AtomicU64,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<SubscriptionId, mpsc::UnboundedSender<SessionEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers().insert(id, tx);
        debug!(subscription = id, "event subscriber added");
        Subscription { id, events: rx }
    }

    /// Remove a subscriber. Returns true if it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.subscribers().remove(&id).is_some();
        if removed {
            debug!(subscription = id, "event subscriber removed");
        }
        removed
    }

    /// Deliver an event to every current subscriber.
    ///
    /// Subscribers whose receiver has been dropped are pruned.
    pub fn publish(&self, event: SessionEvent) {
        let mut subs = self.subscribers();
        subs.retain(|id, tx| {
            let alive = tx.send(event.clone()).is_ok();
            if !alive {
                debug!(subscription = *id, "pruning closed event subscriber");
            }
            alive
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(id: &str, data: &str) -> SessionEvent {
        SessionEvent::Output {
            execution_id: id.into(),
            data: data.into(),
        }
    }

    #[test]
    fn test_publish_reaches_all_subscribers_in_order() {
        let publisher = EventPublisher::new();
        let mut a = publisher.subscribe();
        let mut b = publisher.subscribe();
        assert_ne!(a.id, b.id);

        publisher.publish(output("s1", "one"));
        publisher.publish(output("s1", "two"));

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.events.try_recv().unwrap(), output("s1", "one"));
            assert_eq!(sub.events.try_recv().unwrap(), output("s1", "two"));
            assert!(sub.events.try_recv().is_err());
        }
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let publisher = EventPublisher::new();
        let mut sub = publisher.subscribe();
        assert!(publisher.unsubscribe(sub.id));
        assert!(!publisher.unsubscribe(sub.id));

        publisher.publish(output("s1", "lost"));
        assert!(sub.events.try_recv().is_err());
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[test]
    fn test_late_subscriber_misses_earlier_events() {
        let publisher = EventPublisher::new();
        publisher.publish(output("s1", "early"));
        let mut sub = publisher.subscribe();
        publisher.publish(output("s1", "late"));
        assert_eq!(sub.events.try_recv().unwrap(), output("s1", "late"));
        assert!(sub.events.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let publisher = EventPublisher::new();
        let sub = publisher.subscribe();
        let _keep = publisher.subscribe();
        drop(sub);
        publisher.publish(output("s1", "x"));
        assert_eq!(publisher.subscriber_count(), 1);
    }
}
