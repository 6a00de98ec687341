//! Botkube plugin runtime.
//!
//! Resolves enabled executor and source plugins against repository indexes,
//! downloads and caches their binaries, launches them as subprocesses that
//! speak JSON lines over stdio, and keeps them running:
//!
//! - [`index`]: index format, version ordering, [`IndexBuilder`].
//! - [`download`]: verified index and binary downloads.
//! - [`launcher`]: the process launcher and its handshake.
//! - [`store`]: concurrency-safe registry of running clients.
//! - [`manager`]: cold start and request-path lookups.
//! - [`health`]: restart policy and restart bookkeeping.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod client;
pub mod download;
pub mod error;
pub mod health;
pub mod index;
pub mod key;
pub mod launcher;
pub mod lifecycle;
pub mod manager;
pub mod platform;
pub mod protocol;
pub mod rpc;
pub mod store;

#[cfg(test)]
mod testing;

pub use client::{
    DispensedClient, ExecuteInput, ExecuteOutput, Executor, Metadata, PluginClient, Source,
    SourceEvent, StreamInput,
};
pub use download::Downloader;
pub use error::{PluginError, PluginResult};
pub use health::{HealthMonitor, HealthStats, HealthStatus, PluginStatus};
pub use index::{Index, IndexBuilder, IndexEntry, Repository};
pub use key::{EnabledKeys, PluginKey, PluginKind, collect_enabled_keys};
pub use launcher::{LaunchRequest, LaunchedPlugin, Launcher, ProcessLauncher};
pub use lifecycle::{Cleanup, ExitReport, ProcessExit};
pub use manager::{CrashReport, PluginManager};
pub use platform::Platform;
