use pingwatch::{EventBus, PublishError, TransitionEvent};
use tracing::info;

/// Writes every transition to the log. Never fails.
pub struct LogBus;

#[async_trait::async_trait]
impl EventBus for LogBus {
    async fn publish(&self, topic: &str, key: &str, event: &TransitionEvent) -> Result<(), PublishError> {
        let payload = serde_json::to_string(event).map_err(|e| PublishError::Permanent(e.to_string()))?;
        info!(topic, key, kind = %event.kind(), %payload, "Transition");
        Ok(())
    }
}
