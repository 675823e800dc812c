//! Event bus seam.
//!
//! [`EventBus`] is the publish side of whatever transport carries transition
//! events to the alert lifecycle. [`BroadcastBus`] is the in-process
//! implementation, backed by `tokio::sync::broadcast`.

use tokio::sync::broadcast;

use super::types::TransitionEvent;
use crate::error::PublishError;

/// `publish(topic, key, event) -> ack | error`
#[async_trait::async_trait]
pub trait EventBus: Send + Sync {
    /// Publish `event` on `topic`, partitioned by `key` (the device id)
    async fn publish(&self, topic: &str, key: &str, event: &TransitionEvent) -> Result<(), PublishError>;
}

/// A published event as seen by in-process subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub topic: String,
    pub key: String,
    pub event: TransitionEvent,
}

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out bus.
///
/// Slow subscribers lag and lose the oldest envelopes; publishing never
/// blocks and never fails, even with zero subscribers.
pub struct BroadcastBus {
    sender: broadcast::Sender<Envelope>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait::async_trait]
impl EventBus for BroadcastBus {
    async fn publish(&self, topic: &str, key: &str, event: &TransitionEvent) -> Result<(), PublishError> {
        let envelope = Envelope { topic: topic.to_string(), key: key.to_string(), event: event.clone() };
        // A send error only means nobody is subscribed
        let _ = self.sender.send(envelope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::liveness::state::Transition;
    use crate::target::DeviceId;

    fn event() -> TransitionEvent {
        TransitionEvent::from_transition(
            Transition::Down { at: Utc::now(), consecutive_failures: 3, failure: None, last_success_at: None },
            DeviceId::from("sw-1"),
            "Core switch".to_string(),
            "10.0.0.1".to_string(),
        )
    }

    #[tokio::test]
    async fn zero_capacity_still_delivers() {
        let bus = BroadcastBus::new(0);
        let mut receiver = bus.subscribe();

        bus.publish("device-alerts", "sw-1", &event()).await.unwrap();

        let envelope = receiver.recv().await.unwrap();
        assert_eq!(envelope.key, "sw-1");
        assert_eq!(envelope.topic, "device-alerts");
    }

    #[tokio::test]
    async fn publishing_without_subscribers_succeeds() {
        let bus = BroadcastBus::default();
        assert!(bus.publish("device-alerts", "sw-1", &event()).await.is_ok());
    }
}
