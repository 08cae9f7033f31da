//! Event bus for the Garadex platform.
//!
//! All device controllers publish state changes here; the CLI and any
//! automation layers subscribe. A broadcast channel keeps publishers
//! decoupled from however many subscribers are attached.

use crate::event::{EventMetadata, GaradexEvent};
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Broadcast event bus.
///
/// Publishing never blocks; if a subscriber falls behind, its oldest
/// buffered events are dropped and delivery resumes from the most
/// recent ones.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<(GaradexEvent, EventMetadata)>,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Get the number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event with default metadata.
    ///
    /// Returns `true` if there was at least one subscriber.
    pub fn publish(&self, event: GaradexEvent) -> bool {
        self.publish_with_source(event, "system")
    }

    /// Publish an event with a custom source.
    pub fn publish_with_source(&self, event: GaradexEvent, source: impl Into<String>) -> bool {
        let metadata = EventMetadata::new(source);
        match self.tx.send((event, metadata)) {
            Ok(_) => true,
            Err(broadcast::error::SendError((event, _))) => {
                trace!(device = %event.device_id(), "event dropped, no subscribers");
                false
            }
        }
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for events from the bus.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<(GaradexEvent, EventMetadata)>,
}

impl EventBusReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` when the bus is closed. A lagged subscriber skips
    /// the dropped events and keeps receiving.
    pub async fn recv(&mut self) -> Option<(GaradexEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged, dropping oldest events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<(GaradexEvent, EventMetadata)> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_event(state: &str) -> GaradexEvent {
        GaradexEvent::DeviceState {
            device_id: "garage-1".to_string(),
            previous: "closed".to_string(),
            state: state.to_string(),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        assert!(bus.publish_with_source(state_event("opening"), "test"));

        let (event, meta) = rx.recv().await.unwrap();
        assert_eq!(event.device_id(), "garage-1");
        assert_eq!(meta.source, "test");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert!(!bus.publish(state_event("open")));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(state_event("closing"));
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }
}
