use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::target::DeviceId;

/// Why a probe failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    Timeout,
    Unreachable,
    ConnectionRefused,
    DnsFailure,
    BadStatus,
    /// Fault inside the executor or a checker, never the device's fault alone
    Internal,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::Timeout => "TIMEOUT",
            FailureReason::Unreachable => "UNREACHABLE",
            FailureReason::ConnectionRefused => "CONNECTION_REFUSED",
            FailureReason::DnsFailure => "DNS_FAILURE",
            FailureReason::BadStatus => "BAD_STATUS",
            FailureReason::Internal => "INTERNAL",
        };
        f.write_str(s)
    }
}

/// Classified failure plus the raw error text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeFailure {
    pub reason: FailureReason,
    pub detail: String,
}

/// Immutable result of one probe.
///
/// `latency_ms` is present iff the probe succeeded, `failure` iff it did not;
/// the constructors are the only way to build one, so it is serialize-only:
///
/// ```compile_fail
/// let json = r#"{"device_id":"d","timestamp":"2024-01-01T00:00:00Z","latency_ms":5,"failure":null,"sequence":0}"#;
/// let _: pingwatch::ProbeOutcome = serde_json::from_str(json).unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeOutcome {
    pub device_id: DeviceId,

    /// When the probe completed
    pub timestamp: DateTime<Utc>,

    latency_ms: Option<u64>,

    failure: Option<ProbeFailure>,

    /// Dispatch ticket stamped by the scheduler; zero until dispatched
    pub sequence: u64,
}

impl ProbeOutcome {
    pub fn success(device_id: DeviceId, latency_ms: u64) -> Self {
        Self {
            device_id,
            timestamp: Utc::now(),
            latency_ms: Some(latency_ms),
            failure: None,
            sequence: 0,
        }
    }

    pub fn failure(device_id: DeviceId, reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            device_id,
            timestamp: Utc::now(),
            latency_ms: None,
            failure: Some(ProbeFailure { reason, detail: detail.into() }),
            sequence: 0,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn latency_ms(&self) -> Option<u64> {
        self.latency_ms
    }

    pub fn failure_reason(&self) -> Option<&ProbeFailure> {
        self.failure.as_ref()
    }
}
