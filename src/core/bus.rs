//! Typed Event Bus
//!
//! An explicit publish/subscribe channel, handed by reference to whoever
//! needs it. Each subscription owns its own unbounded queue, so every
//! subscriber sees every event exactly once and in publish order.
//! Dropping a [`Subscription`] unregisters it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

use super::lock;

/// Identifier of a single subscription on a bus.
pub type SubscriptionId = u64;

struct Registry<T> {
    next_id: SubscriptionId,
    subscribers: BTreeMap<SubscriptionId, mpsc::UnboundedSender<T>>,
}

/// A typed multi-subscriber event channel.
///
/// Cloning the bus yields another handle onto the same set of subscribers.
pub struct EventBus<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 1,
                subscribers: BTreeMap::new(),
            })),
        }
    }
}

impl<T> fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<T: Clone> EventBus<T> {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription<T> {
        self.subscribe_with(None)
    }

    /// Register a subscriber whose queue starts with `initial`.
    ///
    /// Callers that need the initial value to be consistent with later
    /// publishes must serialize this call with their own publishes.
    pub(crate) fn subscribe_with(&self, initial: Option<T>) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(value) = initial {
            let _ = tx.send(value);
        }

        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.insert(id, tx);

        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver an event to every live subscriber.
    ///
    /// Returns the number of subscribers reached. Subscribers whose receiving
    /// side is gone are pruned.
    pub fn publish(&self, event: T) -> usize {
        let mut registry = lock(&self.registry);
        let mut delivered = 0;
        registry.subscribers.retain(|_, tx| {
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
                true
            } else {
                false
            }
        });
        delivered
    }
}

impl<T> EventBus<T> {
    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).subscribers.len()
    }

    /// Drop every subscriber. Pending events stay readable; afterwards
    /// `recv` returns `None`.
    pub fn clear(&self) {
        lock(&self.registry).subscribers.clear();
    }
}

/// Receiving side of one bus registration.
pub struct Subscription<T> {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<T>,
    registry: Weak<Mutex<Registry<T>>>,
}

impl<T> Subscription<T> {
    /// This subscription's identifier.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next event. `None` once the bus dropped this subscriber.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Drain everything currently queued.
    pub fn drain(&mut self) -> Vec<T> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Explicitly unregister. Equivalent to dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).subscribers.remove(&self.id);
        }
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
