pub mod state;
pub mod tracker;

pub use state::{HealthStatus, LivenessState, Thresholds, Transition};
pub use tracker::{LivenessTracker, Observation};
