use thiserror::Error;

use crate::target::DeviceId;

/// Unrecoverable scheduler faults. Any of these stops the scheduler loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("task queue lock poisoned")]
    QueuePoisoned,

    #[error("duplicate task for device {0}")]
    DuplicateTask(DeviceId),

    #[error("probe worker panicked: {0}")]
    WorkerPanicked(String),
}

/// Event bus publish failures, classified for the emitter's retry policy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Worth retrying (broker unavailable, timeout, 5xx, ...)
    #[error("transient publish failure: {0}")]
    Transient(String),

    /// Retrying cannot help (rejected payload, closed bus, ...)
    #[error("permanent publish failure: {0}")]
    Permanent(String),
}

impl PublishError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PublishError::Transient(_))
    }
}

/// Invalid inventory record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("device id is empty")]
    EmptyDeviceId,

    #[error("device {0} has a zero probe interval")]
    ZeroInterval(DeviceId),

    #[error("device {0} has neither hostname nor ip address")]
    MissingAddress(DeviceId),

    #[error("device {device_id} has an invalid url: {reason}")]
    InvalidUrl { device_id: DeviceId, reason: String },
}

/// Invalid engine configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("emitter multiplier must be at least 1.0, got {0}")]
    Multiplier(String),

    #[error("breaker.failure_threshold ({breaker}) must be at least liveness.failure_threshold ({liveness})")]
    BreakerBeforeDebounce { breaker: u32, liveness: u32 },
}
