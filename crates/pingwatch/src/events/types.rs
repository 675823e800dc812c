use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::liveness::state::Transition;
use crate::monitoring::types::FailureReason;
use crate::target::DeviceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionType {
    DeviceDown,
    DeviceRecovered,
}

impl fmt::Display for TransitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionType::DeviceDown => write!(f, "DEVICE_DOWN"),
            TransitionType::DeviceRecovered => write!(f, "DEVICE_RECOVERED"),
        }
    }
}

/// Type specific part of a transition event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum TransitionDetail {
    DeviceDown {
        consecutive_failures: u32,
        failure_reason: Option<FailureReason>,
        failure_detail: Option<String>,
        last_success_time: Option<DateTime<Utc>>,
    },
    DeviceRecovered {
        down_since: DateTime<Utc>,
        downtime_ms: i64,
        consecutive_successes: u32,
        current_latency_ms: Option<u64>,
    },
}

/// Confirmed liveness change, published once per transition.
///
/// Consumers de-duplicate on `idempotency_key` (device, type, timestamp);
/// `event_id` is unique per constructed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionEvent {
    pub event_id: Uuid,
    pub idempotency_key: String,
    pub device_id: DeviceId,
    pub device_name: String,
    pub ip_address: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub detail: TransitionDetail,
}

impl TransitionEvent {
    /// Attach device metadata to a transition confirmed by the state machine
    pub fn from_transition(transition: Transition, device_id: DeviceId, device_name: String, ip_address: String) -> Self {
        let (timestamp, detail) = match transition {
            Transition::Down { at, consecutive_failures, failure, last_success_at } => (
                at,
                TransitionDetail::DeviceDown {
                    consecutive_failures,
                    failure_reason: failure.as_ref().map(|f| f.reason),
                    failure_detail: failure.map(|f| f.detail),
                    last_success_time: last_success_at,
                },
            ),
            Transition::Recovered { at, down_since, consecutive_successes, latency_ms } => (
                at,
                TransitionDetail::DeviceRecovered {
                    down_since,
                    downtime_ms: (at - down_since).num_milliseconds(),
                    consecutive_successes,
                    current_latency_ms: latency_ms,
                },
            ),
        };

        let kind = match detail {
            TransitionDetail::DeviceDown { .. } => TransitionType::DeviceDown,
            TransitionDetail::DeviceRecovered { .. } => TransitionType::DeviceRecovered,
        };

        Self {
            event_id: Uuid::new_v4(),
            idempotency_key: idempotency_key(&device_id, kind, timestamp),
            device_id,
            device_name,
            ip_address,
            timestamp,
            detail,
        }
    }

    pub fn kind(&self) -> TransitionType {
        match self.detail {
            TransitionDetail::DeviceDown { .. } => TransitionType::DeviceDown,
            TransitionDetail::DeviceRecovered { .. } => TransitionType::DeviceRecovered,
        }
    }

    /// Outage length, for recovery events only
    pub fn downtime(&self) -> Option<chrono::Duration> {
        match self.detail {
            TransitionDetail::DeviceRecovered { downtime_ms, .. } => {
                Some(chrono::Duration::milliseconds(downtime_ms))
            }
            TransitionDetail::DeviceDown { .. } => None,
        }
    }
}

/// `deviceId:TYPE:timestampMillis`
pub fn idempotency_key(device_id: &DeviceId, kind: TransitionType, timestamp: DateTime<Utc>) -> String {
    format!("{device_id}:{kind}:{}", timestamp.timestamp_millis())
}
