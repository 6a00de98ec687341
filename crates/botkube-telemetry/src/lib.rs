//! Botkube Telemetry - logging setup for the botkube agent.
//!
//! This crate provides configurable `tracing` subscriber setup with
//! multiple formats and targets.
//!
//! # Example
//!
//! ```rust,no_run
//! use botkube_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), botkube_telemetry::TelemetryError> {
//! let config = LogConfig::new("debug")
//!     .with_format(LogFormat::Compact)
//!     .with_directive("botkube_plugins=trace");
//!
//! setup_logging(&config)?;
//! tracing::info!("logging ready");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{LogConfig, LogFormat, LogTarget, setup_default_logging, setup_logging};
