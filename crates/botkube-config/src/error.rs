//! Configuration error types.

use std::io;

use thiserror::Error;

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file at {path}: {source}")]
    ReadError {
        /// Path to the config file that could not be read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Failed to parse TOML configuration.
    #[error("failed to parse config file at {path}: {source}")]
    ParseError {
        /// Path to the config file that failed to parse.
        path: String,
        /// Underlying TOML parse error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more validation rules failed.
    ///
    /// Every violation is collected before reporting so operators can fix
    /// all of them in one pass.
    #[error("invalid configuration:\n{}", format_violations(violations))]
    Invalid {
        /// One human-readable line per violation.
        violations: Vec<String>,
    },

    /// Environment variable error.
    #[error("environment variable '{var_name}': {message}")]
    EnvError {
        /// Name of the environment variable.
        var_name: String,
        /// Error description.
        message: String,
    },
}

fn format_violations(violations: &[String]) -> String {
    violations
        .iter()
        .map(|v| format!("  * {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
