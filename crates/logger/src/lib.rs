//! Shared tracing setup for PingWatch binaries

mod subscriber;

pub use subscriber::{LogFormat, init, init_with};
pub use tracing::level_filters::LevelFilter;
