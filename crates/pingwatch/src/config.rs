//! Engine configuration.
//!
//! Every section deserialises with per-field defaults so a config file only
//! needs to mention the values it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub probe: ProbeConfig,
    pub liveness: LivenessConfig,
    pub emitter: EmitterConfig,
    pub breaker: BreakerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Cadence of the control loop
    pub tick_ms: u64,
    /// Size of the probe worker pool
    pub max_concurrent_probes: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_ms: 100, max_concurrent_probes: 1000 }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Budget for one probe, retries included
    pub timeout_ms: u64,
    pub retry_attempts: u32,
    /// Base delay; attempt `n` waits `n * retry_delay_ms`
    pub retry_delay_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self { timeout_ms: 1000, retry_attempts: 3, retry_delay_ms: 100 }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Consecutive failures before HEALTHY -> UNHEALTHY
    pub failure_threshold: u32,
    /// Consecutive successes before UNHEALTHY -> HEALTHY
    pub recovery_threshold: u32,
    /// Number of lock shards in the state map
    pub shards: usize,
    /// UNHEALTHY states untouched for this long are reported as stale
    pub stale_after_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self { failure_threshold: 3, recovery_threshold: 2, shards: 16, stale_after_secs: 300 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    pub topic: String,
    /// Publish attempts per event, the first one included
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Upper bound for a single publish attempt
    pub publish_timeout_ms: u64,
    /// Events buffered between the probe workers and the publisher
    pub queue_capacity: usize,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            topic: "device-alerts".to_string(),
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5000,
            multiplier: 2.0,
            publish_timeout_ms: 5000,
            queue_capacity: 1024,
        }
    }
}

impl EmitterConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub open_secs: u64,
    pub half_open_interval_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { enabled: true, failure_threshold: 5, open_secs: 300, half_open_interval_secs: 60 }
    }
}

impl EngineConfig {
    /// Reject values that would stall or flap the engine
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, bool); 10] = [
            ("scheduler.tick_ms", self.scheduler.tick_ms == 0),
            ("scheduler.max_concurrent_probes", self.scheduler.max_concurrent_probes == 0),
            ("probe.timeout_ms", self.probe.timeout_ms == 0),
            ("probe.retry_attempts", self.probe.retry_attempts == 0),
            ("liveness.failure_threshold", self.liveness.failure_threshold == 0),
            ("liveness.recovery_threshold", self.liveness.recovery_threshold == 0),
            ("liveness.shards", self.liveness.shards == 0),
            ("emitter.max_attempts", self.emitter.max_attempts == 0),
            ("emitter.publish_timeout_ms", self.emitter.publish_timeout_ms == 0),
            ("emitter.queue_capacity", self.emitter.queue_capacity == 0),
        ];
        if let Some((field, _)) = checks.iter().copied().find(|(_, is_zero)| *is_zero) {
            return Err(ConfigError::Zero { field });
        }
        if self.breaker.enabled && self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Zero { field: "breaker.failure_threshold" });
        }
        // An open circuit stops outcomes, so it must not open before DOWN can fire
        if self.breaker.enabled && self.breaker.failure_threshold < self.liveness.failure_threshold {
            return Err(ConfigError::BreakerBeforeDebounce {
                breaker: self.breaker.failure_threshold,
                liveness: self.liveness.failure_threshold,
            });
        }
        if !(self.emitter.multiplier >= 1.0) {
            return Err(ConfigError::Multiplier(self.emitter.multiplier.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.liveness.failure_threshold, 3);
        assert_eq!(config.liveness.recovery_threshold, 2);
        assert_eq!(config.scheduler.tick_ms, 100);
        assert_eq!(config.emitter.topic, "device-alerts");
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let mut config = EngineConfig::default();
        config.liveness.recovery_threshold = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero { field: "liveness.recovery_threshold" })
        );
    }

    #[test]
    fn breaker_opening_before_down_is_rejected() {
        let mut config = EngineConfig::default();
        config.breaker.failure_threshold = 2;
        assert_eq!(
            config.validate(),
            Err(ConfigError::BreakerBeforeDebounce { breaker: 2, liveness: 3 })
        );

        config.breaker.failure_threshold = 3;
        assert!(config.validate().is_ok());

        config.breaker.failure_threshold = 2;
        config.breaker.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn shrinking_multiplier_is_rejected() {
        let mut config = EngineConfig::default();
        config.emitter.multiplier = 0.5;
        assert!(matches!(config.validate(), Err(ConfigError::Multiplier(_))));
    }

    #[test]
    fn retry_delay_grows_linearly() {
        let probe = ProbeConfig::default();
        assert_eq!(probe.retry_delay(1), Duration::from_millis(100));
        assert_eq!(probe.retry_delay(3), Duration::from_millis(300));
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"liveness":{"failure_threshold":5}}"#).unwrap();
        assert_eq!(config.liveness.failure_threshold, 5);
        assert_eq!(config.liveness.recovery_threshold, 2);
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }
}
