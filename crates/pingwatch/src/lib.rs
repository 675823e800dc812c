//! PingWatch - device liveness engine
//!
//! Probes a fleet of network devices on per-device intervals, debounces the
//! raw results into HEALTHY/UNHEALTHY states and publishes one event per
//! confirmed transition.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod liveness;
pub mod metrics;
pub mod monitoring;
pub mod target;

// Re-export main types
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{ConfigError, PublishError, SchedulerError, TargetError};
pub use events::{BroadcastBus, EventBus, TransitionEvent, TransitionType};
pub use liveness::{HealthStatus, LivenessState, LivenessTracker};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use monitoring::{MonitoringScheduler, ProbeExecutor, ProbeOutcome, Prober};
pub use target::{DeviceId, MonitoredTarget, ProbeKind};
