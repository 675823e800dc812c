use std::time::Duration;

use pingwatch::{EventBus, PublishError, TransitionEvent};
use reqwest::StatusCode;
use url::Url;

/// HTTP POST of the JSON event to a single endpoint
pub struct WebhookBus {
    client: reqwest::Client,
    url: Url,
}

impl WebhookBus {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

/// 408, 429 and 5xx are worth another try; any other rejection is final
fn classify_status(status: StatusCode) -> Result<(), PublishError> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("webhook returned HTTP {}", status.as_u16());
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS {
        Err(PublishError::Transient(message))
    } else {
        Err(PublishError::Permanent(message))
    }
}

fn classify_error(error: reqwest::Error) -> PublishError {
    if error.is_builder() {
        PublishError::Permanent(error.to_string())
    } else {
        PublishError::Transient(error.to_string())
    }
}

#[async_trait::async_trait]
impl EventBus for WebhookBus {
    async fn publish(&self, topic: &str, key: &str, event: &TransitionEvent) -> Result<(), PublishError> {
        let response = self
            .client
            .post(self.url.clone())
            .header("Idempotency-Key", event.idempotency_key.as_str())
            .header("X-Partition-Key", key)
            .header("X-Topic", topic)
            .json(event)
            .send()
            .await
            .map_err(classify_error)?;
        classify_status(response.status())
    }
}
