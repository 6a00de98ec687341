#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! Configuration system for the botkube agent.
//!
//! This crate provides a single [`Config`] type covering logging, the plugin
//! runtime (repositories, cache directory, restart policy, timeouts) and the
//! executor/source bindings that decide which plugins are enabled.
//!
//! # Usage
//!
//! ```rust,no_run
//! use botkube_config::Config;
//!
//! // Load with precedence chain (defaults → file → env).
//! let config = Config::load(Some(std::path::Path::new("config.toml"))).unwrap();
//! println!("cache dir: {}", config.plugins.cache_dir.display());
//! ```
//!
//! # Configuration Precedence
//!
//! From highest to lowest priority:
//!
//! 1. **Environment variables** (`BOTKUBE_PLUGINS_CACHE_DIR`, ...)
//! 2. **Config file** (explicit path, or `BOTKUBE_CONFIG`)
//! 3. **Embedded defaults** (`defaults.toml` compiled into binary)
//!
//! # Design
//!
//! This crate has **no dependencies on other internal botkube crates**.
//! Plugin keys are kept as raw strings here; parsing them into typed keys
//! happens in `botkube-plugins` so that every malformed key can be reported
//! together with the other startup violations.

/// Configuration error types.
pub mod error;
/// Configuration file discovery and loading.
pub mod loader;
/// Configuration struct definitions.
pub mod types;
/// Configuration validation rules.
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use types::*;

impl Config {
    /// Load configuration with the full precedence chain.
    ///
    /// See [`loader::load`] for the algorithm.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the config file is malformed or the final
    /// configuration fails validation.
    pub fn load(path: Option<&std::path::Path>) -> ConfigResult<Self> {
        loader::load(path)
    }

    /// Load configuration from a single file (defaults still apply, env does not).
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load_file(path: &std::path::Path) -> ConfigResult<Self> {
        loader::load_file(path)
    }
}
