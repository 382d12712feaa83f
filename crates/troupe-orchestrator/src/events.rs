//! Event fan-out to kernel subscribers
//!
//! An explicit subscriber list with a manual [`EventBus::emit`]. Listeners are
//! plain callbacks; they run outside the subscriber lock, in subscription order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::debug;
use troupe_core::RuntimeEvent;

/// Callback invoked for every emitted event
pub type Listener = Arc<dyn Fn(&RuntimeEvent) + Send + Sync>;

/// Subscriber registry for [`RuntimeEvent`]s
pub struct EventBus {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(u64, Listener)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener; drop the returned handle's registration with
    /// [`Subscription::unsubscribe`]
    pub async fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&RuntimeEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().await.push((id, Arc::new(listener)));
        debug!("Event subscriber {} registered", id);
        Subscription {
            id,
            bus: Arc::downgrade(self),
        }
    }

    /// Deliver an event to every current listener
    pub async fn emit(&self, event: RuntimeEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .await
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        debug!(
            "Emitting {} to {} subscribers",
            event.kind,
            listeners.len()
        );
        for listener in listeners {
            listener(&event);
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    async fn remove(&self, id: u64) -> bool {
        let mut listeners = self.listeners.write().await;
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<EventBus>,
}

impl Subscription {
    /// Stop receiving events; returns whether the listener was still registered
    pub async fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => bus.remove(self.id).await,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use troupe_core::EventKind;

    #[tokio::test]
    async fn test_emit_reaches_all_subscribers() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let a = seen.clone();
        let _sub_a = bus
            .subscribe(move |e| a.lock().unwrap().push(("a", e.kind)))
            .await;
        let b = seen.clone();
        let _sub_b = bus
            .subscribe(move |e| b.lock().unwrap().push(("b", e.kind)))
            .await;

        bus.emit(RuntimeEvent::new(EventKind::GoalStarted, serde_json::json!({})))
            .await;

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![("a", EventKind::GoalStarted), ("b", EventKind::GoalStarted)]
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicU64::new(0));

        let c = count.clone();
        let sub = bus
            .subscribe(move |_| {
                c.fetch_add(1, Ordering::Relaxed);
            })
            .await;

        bus.emit(RuntimeEvent::new(EventKind::TaskStarted, serde_json::json!({})))
            .await;
        assert!(sub.unsubscribe().await);
        bus.emit(RuntimeEvent::new(EventKind::TaskStarted, serde_json::json!({})))
            .await;

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscriber_count().await, 0);
    }
}
