//! Broadcast-backed event bus.
//!
//! In-process implementation of the `EventBus` port for consumers that want
//! a live event feed (the CLI's event log, tests). Delivery is best-effort:
//! lagging receivers lose events, which is the documented broadcast
//! contract.

use tokio::sync::broadcast;
use tracing::debug;

use trellis_core::events::SupervisorEvent;
use trellis_core::ports::EventBus;

/// Broadcast channel capacity for lifecycle events.
const CHANNEL_CAPACITY: usize = 64;

/// Fan-out bus over `tokio::sync::broadcast`.
pub struct BroadcastEventBus {
    sender: broadcast::Sender<SupervisorEvent>,
}

impl BroadcastEventBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: SupervisorEvent) {
        debug!(?event, "publishing lifecycle event");
        // Send fails only when no receiver exists; that is not an error.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_published_events() {
        let bus = BroadcastEventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(SupervisorEvent::Started {
            service: "web".into(),
            pid: 1,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.service(), "web");
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = BroadcastEventBus::new();
        bus.publish(SupervisorEvent::Stopped {
            service: "web".into(),
            exit_code: 0,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
