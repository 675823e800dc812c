use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::monitoring::types::{ProbeFailure, ProbeOutcome};
use crate::target::DeviceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Unhealthy => write!(f, "UNHEALTHY"),
        }
    }
}

impl std::str::FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HEALTHY" => Ok(HealthStatus::Healthy),
            "UNHEALTHY" => Ok(HealthStatus::Unhealthy),
            other => Err(format!("unknown health status {other:?}")),
        }
    }
}

/// Debounce thresholds, both at least one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub failure: u32,
    pub recovery: u32,
}

/// A confirmed status change, before device metadata is attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Down {
        at: DateTime<Utc>,
        consecutive_failures: u32,
        failure: Option<ProbeFailure>,
        last_success_at: Option<DateTime<Utc>>,
    },
    Recovered {
        at: DateTime<Utc>,
        down_since: DateTime<Utc>,
        consecutive_successes: u32,
        latency_ms: Option<u64>,
    },
}

/// Liveness of one device.
///
/// At most one of the two counters is non-zero, and `down_since` is set iff
/// the status is UNHEALTHY.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessState {
    pub device_id: DeviceId,
    pub status: HealthStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub down_since: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl LivenessState {
    pub fn new(device_id: DeviceId, now: DateTime<Utc>) -> Self {
        Self {
            device_id,
            status: HealthStatus::Healthy,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            down_since: None,
            updated_at: now,
        }
    }

    /// Fold one outcome into the state, returning the transition it confirmed
    pub fn apply(&mut self, outcome: &ProbeOutcome, thresholds: Thresholds) -> Option<Transition> {
        let now = outcome.timestamp;
        self.updated_at = now;

        if outcome.is_success() {
            self.consecutive_failures = 0;
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            self.last_success_at = Some(now);

            if self.status == HealthStatus::Unhealthy && self.consecutive_successes >= thresholds.recovery {
                let down_since = self.down_since.take().unwrap_or(now);
                self.status = HealthStatus::Healthy;
                return Some(Transition::Recovered {
                    at: now,
                    down_since,
                    consecutive_successes: self.consecutive_successes,
                    latency_ms: outcome.latency_ms(),
                });
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.last_failure_at = Some(now);

            if self.status == HealthStatus::Healthy && self.consecutive_failures >= thresholds.failure {
                self.status = HealthStatus::Unhealthy;
                self.down_since = Some(now);
                return Some(Transition::Down {
                    at: now,
                    consecutive_failures: self.consecutive_failures,
                    failure: outcome.failure_reason().cloned(),
                    last_success_at: self.last_success_at,
                });
            }
        }

        None
    }

    /// Restart both runs, keeping status and timestamps
    pub fn reset_counters(&mut self) {
        self.consecutive_successes = 0;
        self.consecutive_failures = 0;
    }

    /// Repair a state loaded from storage so the invariants hold again
    pub fn normalize(mut self) -> Self {
        if self.consecutive_successes > 0 && self.consecutive_failures > 0 {
            self.reset_counters();
        }
        match self.status {
            HealthStatus::Healthy => self.down_since = None,
            HealthStatus::Unhealthy => {
                if self.down_since.is_none() {
                    self.down_since = Some(self.last_failure_at.unwrap_or(self.updated_at));
                }
            }
        }
        self
    }

    pub fn holds_invariants(&self) -> bool {
        let one_run = self.consecutive_successes == 0 || self.consecutive_failures == 0;
        let down_matches = self.down_since.is_some() == (self.status == HealthStatus::Unhealthy);
        one_run && down_matches
    }
}
