//! Typed publish-subscribe for agent events.
//!
//! Each protocol client owns an `EventBus<InboundEvent>` and publishes every
//! event it decodes, in arrival order. Consumers (approval prompts, UIs,
//! transcript viewers) call [`EventBus::subscribe`]; dropping the returned
//! receiver is the unsubscribe.
//!
//! # Example
//!
//! ```rust
//! use codex_bridge_core::event_bus::EventBus;
//!
//! let bus: EventBus<String> = EventBus::new();
//! let mut rx = bus.subscribe();
//! assert_eq!(bus.publish("hello".to_string()), 1);
//! assert_eq!(rx.try_recv().unwrap(), "hello");
//! ```

use tokio::sync::broadcast;

/// Default channel capacity for the event bus.
/// Events beyond this capacity will cause slow subscribers to miss events (lag).
const DEFAULT_CAPACITY: usize = 1024;

/// A subscription to an [`EventBus`]. Drop it to unsubscribe.
pub type Subscription<T> = broadcast::Receiver<T>;

pub struct EventBus<T> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus that buffers up to `capacity` events per slow subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns how many subscribers received it. With no subscribers the event
    /// is dropped and 0 is returned.
    pub fn publish(&self, event: T) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> Subscription<T> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
