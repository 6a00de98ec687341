//! Plugin runtime error types.

use std::path::PathBuf;

use crate::key::PluginKind;

/// Errors from the plugin runtime.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// Plugin configuration is invalid. Every violation is listed.
    #[error("invalid plugin configuration:\n{}", bullet_list(.violations))]
    InvalidConfig {
        /// One entry per problem found.
        violations: Vec<String>,
    },

    /// A plugin key could not be parsed.
    #[error("invalid plugin key '{input}':\n{}", bullet_list(.violations))]
    InvalidKey {
        /// The raw key as written.
        input: String,
        /// One entry per problem found.
        violations: Vec<String>,
    },

    /// The plugin (or the requested version) is absent from the repository index.
    #[error("{kind} plugin {key} not found in the repository index")]
    NotFound {
        /// Plugin kind that was looked up.
        kind: PluginKind,
        /// Key as requested, including the version when pinned.
        key: String,
    },

    /// The plugin was never enabled in the configuration.
    #[error("{kind} plugin '{name}' is not enabled")]
    NotEnabled {
        /// Plugin kind that was looked up.
        kind: PluginKind,
        /// Name as requested by the caller.
        name: String,
    },

    /// The plugin is enabled but has no running instance (recovering or deactivated).
    #[error("{kind} plugin {key} is currently unavailable")]
    Unavailable {
        /// Plugin kind.
        kind: PluginKind,
        /// The enabled key.
        key: String,
    },

    /// The plugin manager has not finished starting.
    #[error("plugin manager has not been started")]
    NotStarted,

    /// The index entry has no download URL for the running platform.
    #[error("plugin {key} has no binary for platform {platform}")]
    MissingPlatform {
        /// The plugin key.
        key: String,
        /// The `os/arch` selector that was looked up.
        platform: String,
    },

    /// A network request failed before a response was received.
    #[error("request to {url} failed: {message}")]
    Transport {
        /// Requested URL.
        url: String,
        /// Failure reason.
        message: String,
    },

    /// A server answered with a non-success status.
    #[error("request to {url} returned HTTP {status}")]
    HttpStatus {
        /// Requested URL.
        url: String,
        /// Response status code.
        status: u16,
    },

    /// A download exceeded the size limit.
    #[error("download of {url} exceeds the {limit} byte limit")]
    TooLarge {
        /// Requested URL.
        url: String,
        /// Configured limit in bytes.
        limit: u64,
    },

    /// The downloaded content does not match the expected checksum.
    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Requested URL.
        url: String,
        /// Expected hex digest.
        expected: String,
        /// Computed hex digest.
        actual: String,
    },

    /// A checksum string is not a valid SHA-256 digest.
    #[error("invalid checksum '{0}': expected 'sha256:<64 hex chars>'")]
    InvalidChecksum(String),

    /// A repository index could not be parsed.
    #[error("failed to parse index of repository '{repository}': {message}")]
    IndexParse {
        /// Repository name.
        repository: String,
        /// Parse error message.
        message: String,
    },

    /// A file in the binaries directory does not follow `{kind}_{name}_{os}_{arch}`.
    #[error("malformed plugin artifact name '{file}': {reason}")]
    MalformedArtifact {
        /// Offending file name.
        file: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The plugin process could not be started.
    #[error("failed to launch plugin {key}: {message}")]
    LaunchFailed {
        /// The plugin key.
        key: String,
        /// Failure reason.
        message: String,
    },

    /// The plugin process did not complete the handshake.
    #[error("handshake with plugin {key} failed: {message}")]
    Handshake {
        /// The plugin key.
        key: String,
        /// Failure reason.
        message: String,
    },

    /// The plugin dispensed a client of the wrong kind.
    #[error("plugin {key} dispensed a {actual} client, expected {expected}")]
    UnexpectedClient {
        /// The plugin key.
        key: String,
        /// Kind the configuration asked for.
        expected: PluginKind,
        /// Kind the plugin reported.
        actual: String,
    },

    /// A plugin call returned an error.
    #[error("plugin call '{method}' failed: {message}")]
    Rpc {
        /// RPC method name.
        method: String,
        /// Error reported by the plugin.
        message: String,
    },

    /// The connection to the plugin process is gone.
    #[error("plugin connection closed")]
    ConnectionClosed,

    /// A plugin kept crashing and the restart policy escalates to the agent.
    #[error("plugin {key} reached its restart threshold ({restarts} restarts)")]
    RestartThresholdReached {
        /// The plugin key.
        key: String,
        /// Restart count when the threshold was hit.
        restarts: u32,
    },

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// File system error with the path involved.
    #[error("I/O error at {path}: {source}")]
    FileSystem {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PluginError {
    /// Whether the plugin or version is missing from the index.
    ///
    /// Callers react by forcing an index refresh and retrying once.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the error comes from the network and may succeed on retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::HttpStatus { .. })
    }

    pub(crate) fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileSystem {
            path: path.into(),
            source,
        }
    }
}

fn bullet_list(violations: &[String]) -> String {
    violations
        .iter()
        .map(|v| format!("  * {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Result type for plugin runtime operations.
pub type PluginResult<T> = Result<T, PluginError>;
