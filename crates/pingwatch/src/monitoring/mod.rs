pub mod breaker;
pub mod checker;
pub mod executor;
pub mod queue;
pub mod scheduler;
pub mod types;

pub use breaker::{BreakerCounts, CircuitBreaker, CircuitState};
pub use checker::{CheckError, Checker, HttpChecker, IcmpChecker, TcpChecker};
pub use executor::{ProbeExecutor, Prober};
pub use queue::{ScheduledTask, TaskQueue};
pub use scheduler::MonitoringScheduler;
pub use types::{FailureReason, ProbeFailure, ProbeOutcome};
