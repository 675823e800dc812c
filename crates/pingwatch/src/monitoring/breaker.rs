//! Per-device circuit breaker.
//!
//! Devices that keep failing are probed less often: after
//! `failure_threshold` consecutive failures the circuit opens and probes
//! are skipped for `open_secs`, then a single test probe is let through
//! every `half_open_interval_secs` until one succeeds.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::target::DeviceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    changed_at: Instant,
    last_half_open_test: Option<Instant>,
}

impl Circuit {
    fn closed(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            changed_at: now,
            last_half_open_test: None,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.changed_at = now;
        self.last_half_open_test = None;
    }
}

/// Number of circuits per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BreakerCounts {
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    circuits: Mutex<HashMap<DeviceId, Circuit>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self { config, circuits: Mutex::new(HashMap::new()) }
    }

    fn circuits(&self) -> MutexGuard<'_, HashMap<DeviceId, Circuit>> {
        self.circuits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_duration(&self) -> Duration {
        Duration::from_secs(self.config.open_secs)
    }

    fn half_open_interval(&self) -> Duration {
        Duration::from_secs(self.config.half_open_interval_secs)
    }

    /// Whether a probe may run for this device now
    pub fn allow(&self, device_id: &DeviceId, now: Instant) -> bool {
        if !self.config.enabled {
            return true;
        }

        let mut circuits = self.circuits();
        let Some(circuit) = circuits.get_mut(device_id) else {
            return true;
        };

        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if now.saturating_duration_since(circuit.changed_at) > self.open_duration() {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.changed_at = now;
                    circuit.last_half_open_test = Some(now);
                    info!(device_id = %device_id, "Circuit half-open, allowing test probe");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => match circuit.last_half_open_test {
                Some(last) if now.saturating_duration_since(last) < self.half_open_interval() => false,
                _ => {
                    circuit.last_half_open_test = Some(now);
                    true
                }
            },
        }
    }

    pub fn record_success(&self, device_id: &DeviceId) {
        if !self.config.enabled {
            return;
        }

        let mut circuits = self.circuits();
        let Some(circuit) = circuits.get_mut(device_id) else {
            return;
        };
        if circuit.state == CircuitState::Closed {
            circuit.consecutive_failures = 0;
            return;
        }

        circuits.remove(device_id);
        info!(device_id = %device_id, "Circuit closed after successful probe");
    }

    pub fn record_failure(&self, device_id: &DeviceId, now: Instant) {
        if !self.config.enabled {
            return;
        }

        let mut circuits = self.circuits();
        let circuit = circuits.entry(device_id.clone()).or_insert_with(|| Circuit::closed(now));

        match circuit.state {
            CircuitState::Closed => {
                circuit.consecutive_failures += 1;
                if circuit.consecutive_failures >= self.config.failure_threshold {
                    circuit.open(now);
                    warn!(
                        device_id = %device_id,
                        failures = circuit.consecutive_failures,
                        "Circuit opened, pausing probes"
                    );
                }
            }
            CircuitState::HalfOpen => {
                circuit.open(now);
                info!(device_id = %device_id, "Circuit reopened after failed test probe");
            }
            CircuitState::Open => {}
        }
    }

    /// Forget the device's circuit
    pub fn reset(&self, device_id: &DeviceId) {
        self.circuits().remove(device_id);
    }

    pub fn state(&self, device_id: &DeviceId) -> CircuitState {
        self.circuits().get(device_id).map(|c| c.state).unwrap_or(CircuitState::Closed)
    }

    pub fn counts(&self) -> BreakerCounts {
        let circuits = self.circuits();
        circuits.values().fold(BreakerCounts::default(), |mut counts, circuit| {
            match circuit.state {
                CircuitState::Closed => counts.closed += 1,
                CircuitState::Open => counts.open += 1,
                CircuitState::HalfOpen => counts.half_open += 1,
            }
            counts
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            enabled: true,
            failure_threshold: 2,
            open_secs: 60,
            half_open_interval_secs: 10,
        })
    }

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = breaker();
        let id = DeviceId::from("d");
        let now = Instant::now();

        breaker.record_failure(&id, now);
        assert!(breaker.allow(&id, now));
        breaker.record_failure(&id, now);
        assert_eq!(breaker.state(&id), CircuitState::Open);
        assert!(!breaker.allow(&id, now + Duration::from_secs(30)));
    }

    #[test]
    fn success_resets_failure_run() {
        let breaker = breaker();
        let id = DeviceId::from("d");
        let now = Instant::now();

        breaker.record_failure(&id, now);
        breaker.record_success(&id);
        breaker.record_failure(&id, now);
        assert_eq!(breaker.state(&id), CircuitState::Closed);
    }

    #[test]
    fn half_open_lets_one_probe_per_interval() {
        let breaker = breaker();
        let id = DeviceId::from("d");
        let now = Instant::now();
        breaker.record_failure(&id, now);
        breaker.record_failure(&id, now);

        let later = now + Duration::from_secs(61);
        assert!(breaker.allow(&id, later));
        assert_eq!(breaker.state(&id), CircuitState::HalfOpen);
        assert!(!breaker.allow(&id, later + Duration::from_secs(5)));
        assert!(breaker.allow(&id, later + Duration::from_secs(10)));
    }

    #[test]
    fn half_open_failure_reopens_and_success_closes() {
        let breaker = breaker();
        let id = DeviceId::from("d");
        let now = Instant::now();
        breaker.record_failure(&id, now);
        breaker.record_failure(&id, now);

        let later = now + Duration::from_secs(61);
        assert!(breaker.allow(&id, later));
        breaker.record_failure(&id, later);
        assert_eq!(breaker.state(&id), CircuitState::Open);

        let much_later = later + Duration::from_secs(61);
        assert!(breaker.allow(&id, much_later));
        breaker.record_success(&id);
        assert_eq!(breaker.state(&id), CircuitState::Closed);
        assert_eq!(breaker.counts(), BreakerCounts::default());
    }

    #[test]
    fn disabled_breaker_always_allows() {
        let breaker = CircuitBreaker::new(BreakerConfig { enabled: false, ..BreakerConfig::default() });
        let id = DeviceId::from("d");
        let now = Instant::now();
        for _ in 0..10 {
            breaker.record_failure(&id, now);
        }
        assert!(breaker.allow(&id, now));
    }
}
