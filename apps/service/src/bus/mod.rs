//! Event bus adapters selected by the `[bus]` config section

mod log;
mod webhook;
mod zeromq;

pub use log::LogBus;
pub use webhook::WebhookBus;
pub use zeromq::ZmqBus;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pingwatch::EventBus;
use tracing::info;

use crate::config::{self, BusKind};

/// Build the bus the config asks for
pub fn build(config: &config::Bus) -> Result<Arc<dyn EventBus>> {
    let bus: Arc<dyn EventBus> = match config.kind {
        BusKind::Log => Arc::new(LogBus),
        BusKind::Zeromq => {
            let endpoint = config.zeromq.endpoint();
            let bus = ZmqBus::bind(&endpoint).with_context(|| format!("failed to bind {endpoint}"))?;
            info!(endpoint = %bus.endpoint().unwrap_or(endpoint), "Publishing transitions over ZeroMQ");
            Arc::new(bus)
        }
        BusKind::Webhook => {
            let url = url::Url::parse(&config.webhook.url)
                .with_context(|| format!("invalid webhook url {:?}", config.webhook.url))?;
            info!(url = %url, "Publishing transitions to webhook");
            Arc::new(WebhookBus::new(url, Duration::from_millis(config.webhook.timeout_ms))?)
        }
    };
    Ok(bus)
}
