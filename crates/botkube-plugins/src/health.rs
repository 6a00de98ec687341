//! Crash supervision and restart bookkeeping.

mod monitor;
mod stats;

pub use monitor::HealthMonitor;
pub use stats::{HealthStats, HealthStatus, PluginStatus};
