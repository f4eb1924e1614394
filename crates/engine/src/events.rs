//! Multi-subscriber event fan-out
//!
//! Every component owns one `EventBus` for its own event type. Subscribers
//! receive every event emitted after they subscribed; emitting with no
//! subscribers is not an error.

use tokio::sync::broadcast;

/// Default per-subscriber buffer before slow receivers start lagging
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Broadcast-style observer list
#[derive(Debug, Clone)]
pub struct EventBus<E: Clone> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    /// Create a bus with the given per-subscriber buffer
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Deliver an event to all current subscribers, returning how many received it
    pub fn emit(&self, event: E) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let bus: EventBus<u32> = EventBus::default();
        assert_eq!(bus.emit(1), 0);
    }

    #[test]
    fn test_every_subscriber_receives() {
        let bus: EventBus<&'static str> = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.emit("connected"), 2);
        assert_eq!(a.try_recv().unwrap(), "connected");
        assert_eq!(b.try_recv().unwrap(), "connected");
        assert!(a.try_recv().is_err());
    }
}
