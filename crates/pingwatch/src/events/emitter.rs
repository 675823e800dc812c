//! Transition event emitter.
//!
//! Probe workers hand events to an [`EmitterHandle`], which never blocks: the
//! event goes into a bounded channel drained by one background task that
//! publishes with exponential backoff. Events that cannot be delivered are
//! logged at error level and dropped.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bus::EventBus;
use super::types::TransitionEvent;
use crate::config::EmitterConfig;
use crate::error::PublishError;
use crate::metrics::EngineMetrics;

/// Final result of publishing one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Published { attempts: u32 },
    Dropped { attempts: u32, error: PublishError },
}

/// Calculate the next backoff delay, clamped to the configured maximum
pub fn next_delay(current: Duration, config: &EmitterConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_backoff())
}

/// Add up to 10% random jitter so retries from many devices spread out
fn jittered(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 10;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

pub struct TransitionEmitter {
    bus: Arc<dyn EventBus>,
    config: EmitterConfig,
    metrics: Arc<EngineMetrics>,
}

impl TransitionEmitter {
    pub fn new(bus: Arc<dyn EventBus>, config: EmitterConfig, metrics: Arc<EngineMetrics>) -> Self {
        Self { bus, config, metrics }
    }

    async fn publish_once(&self, event: &TransitionEvent) -> Result<(), PublishError> {
        let publish = self.bus.publish(&self.config.topic, event.device_id.as_str(), event);
        match tokio::time::timeout(self.config.publish_timeout(), publish).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Transient(format!(
                "publish timed out after {}ms",
                self.config.publish_timeout_ms
            ))),
        }
    }

    /// Publish one event, retrying transient failures with bounded backoff
    pub async fn publish_with_retry(&self, event: &TransitionEvent) -> Delivery {
        let mut delay = self.config.initial_backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let error = match self.publish_once(event).await {
                Ok(()) => {
                    self.metrics.event_published();
                    if attempt > 1 {
                        info!(
                            event_id = %event.event_id,
                            device_id = %event.device_id,
                            attempt,
                            "Published transition event after retry"
                        );
                    } else {
                        debug!(event_id = %event.event_id, kind = %event.kind(), "Published transition event");
                    }
                    return Delivery::Published { attempts: attempt };
                }
                Err(error) => error,
            };

            if error.is_transient() && attempt < self.config.max_attempts {
                warn!(
                    event_id = %event.event_id,
                    device_id = %event.device_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Publish attempt failed, retrying"
                );
                self.metrics.publish_retry();
                tokio::time::sleep(jittered(delay)).await;
                delay = next_delay(delay, &self.config);
                continue;
            }

            let payload = serde_json::to_string(event).unwrap_or_default();
            error!(
                event_id = %event.event_id,
                device_id = %event.device_id,
                kind = %event.kind(),
                attempts = attempt,
                error = %error,
                event = %payload,
                "Dropping transition event"
            );
            self.metrics.event_dropped();
            return Delivery::Dropped { attempts: attempt, error };
        }
    }

    /// Move the emitter onto a background task.
    ///
    /// On cancellation the task stops accepting events, publishes whatever is
    /// still buffered and exits.
    pub fn spawn(self, cancel: CancellationToken) -> (EmitterHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(self.config.queue_capacity.max(1));
        let handle = EmitterHandle { sender, metrics: self.metrics.clone() };
        let task = tokio::spawn(self.run(receiver, cancel));
        (handle, task)
    }

    async fn run(self, mut receiver: mpsc::Receiver<TransitionEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(event) => {
                        self.publish_with_retry(&event).await;
                    }
                    None => return,
                },
            }
        }

        receiver.close();
        let mut drained = 0usize;
        while let Some(event) = receiver.recv().await {
            self.publish_with_retry(&event).await;
            drained += 1;
        }
        info!(drained, "Transition emitter stopped");
    }
}

/// Cheap, cloneable sending side of the emitter
#[derive(Clone)]
pub struct EmitterHandle {
    sender: mpsc::Sender<TransitionEvent>,
    metrics: Arc<EngineMetrics>,
}

impl EmitterHandle {
    /// Queue an event for publishing without waiting. Returns `false` if the
    /// event was dropped because the queue is full or the emitter stopped.
    pub fn emit(&self, event: TransitionEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                self.metrics.event_dropped();
                error!(
                    event_id = %event.event_id,
                    device_id = %event.device_id,
                    kind = %event.kind(),
                    idempotency_key = %event.idempotency_key,
                    "Emitter queue full, dropping transition event"
                );
                false
            }
            Err(TrySendError::Closed(event)) => {
                self.metrics.event_dropped();
                error!(
                    event_id = %event.event_id,
                    device_id = %event.device_id,
                    kind = %event.kind(),
                    idempotency_key = %event.idempotency_key,
                    "Emitter stopped, dropping transition event"
                );
                false
            }
        }
    }

    /// Events waiting to be published
    pub fn backlog(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}
