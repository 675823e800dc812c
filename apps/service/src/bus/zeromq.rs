use std::sync::Mutex;

use pingwatch::{EventBus, PublishError, TransitionEvent};

/// ZeroMQ PUB socket.
///
/// Each event goes out as a three frame message: topic, partition key and
/// the JSON payload. Subscribers filter on the topic frame.
pub struct ZmqBus {
    _context: zmq::Context,
    socket: Mutex<zmq::Socket>,
}

impl ZmqBus {
    pub fn bind(endpoint: &str) -> Result<Self, zmq::Error> {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::PUB)?;
        socket.set_linger(0)?;
        socket.bind(endpoint)?;
        Ok(Self { _context: context, socket: Mutex::new(socket) })
    }

    /// Bound endpoint, with the real port when bound to `*`
    pub fn endpoint(&self) -> Option<String> {
        let socket = self.socket.lock().ok()?;
        socket.get_last_endpoint().ok()?.ok()
    }
}

fn classify(error: zmq::Error) -> PublishError {
    match error {
        zmq::Error::EAGAIN | zmq::Error::EINTR => PublishError::Transient(error.to_string()),
        other => PublishError::Permanent(other.to_string()),
    }
}

#[async_trait::async_trait]
impl EventBus for ZmqBus {
    async fn publish(&self, topic: &str, key: &str, event: &TransitionEvent) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(event).map_err(|e| PublishError::Permanent(e.to_string()))?;
        let socket = self.socket.lock().map_err(|_| PublishError::Permanent("socket lock poisoned".into()))?;
        // Non-blocking: a full high water mark surfaces as EAGAIN
        socket
            .send_multipart([topic.as_bytes(), key.as_bytes(), payload.as_slice()], zmq::DONTWAIT)
            .map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pingwatch::DeviceId;
    use pingwatch::liveness::Transition;

    #[test]
    fn would_block_is_transient() {
        assert!(classify(zmq::Error::EAGAIN).is_transient());
        assert!(!classify(zmq::Error::ETERM).is_transient());
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let bus = ZmqBus::bind("tcp://127.0.0.1:*").unwrap();
        assert!(bus.endpoint().is_some_and(|e| e.starts_with("tcp://127.0.0.1:")));

        let event = TransitionEvent::from_transition(
            Transition::Down { at: Utc::now(), consecutive_failures: 3, failure: None, last_success_at: None },
            DeviceId::from("ap-3"),
            "ap-3".to_string(),
            "10.0.0.3".to_string(),
        );
        assert_eq!(bus.publish("device-alerts", "ap-3", &event).await, Ok(()));
    }
}
