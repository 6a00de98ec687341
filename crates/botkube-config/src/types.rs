//! Configuration types for the botkube agent.
//!
//! All types in this module are self-contained with no dependencies on other
//! internal botkube crates. Every struct implements [`Default`] with
//! production defaults so that a bare `[section]` header in TOML produces a
//! working configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration for the botkube agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging level, format, and per-crate directives.
    pub log: LogSection,
    /// Plugin runtime settings.
    pub plugins: PluginsSection,
    /// Executor bindings: group name → plugin key → binding.
    pub executors: BTreeMap<String, BTreeMap<String, PluginBinding>>,
    /// Source bindings: group name → plugin key → binding.
    pub sources: BTreeMap<String, BTreeMap<String, PluginBinding>>,
}

impl Config {
    /// Raw keys of every enabled executor plugin across all binding groups.
    ///
    /// Duplicates across groups collapse to one entry.
    #[must_use]
    pub fn enabled_executor_keys(&self) -> BTreeSet<&str> {
        enabled_keys(&self.executors)
    }

    /// Raw keys of every enabled source plugin across all binding groups.
    #[must_use]
    pub fn enabled_source_keys(&self) -> BTreeSet<&str> {
        enabled_keys(&self.sources)
    }
}

fn enabled_keys(groups: &BTreeMap<String, BTreeMap<String, PluginBinding>>) -> BTreeSet<&str> {
    groups
        .values()
        .flat_map(|bindings| bindings.iter())
        .filter(|(_, binding)| binding.enabled)
        .map(|(key, _)| key.as_str())
        .collect()
}

// ---------------------------------------------------------------------------
// LogSection
// ---------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Output format (`pretty`, `compact`, `json`, `full`).
    pub format: String,
    /// Directory for rolling log files. Logs go to stderr when unset.
    pub directory: Option<PathBuf>,
    /// Per-target directive overrides (e.g. `botkube_plugins=debug`).
    pub directives: Vec<String>,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "pretty".to_owned(),
            directory: None,
            directives: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// PluginsSection
// ---------------------------------------------------------------------------

/// Plugin runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsSection {
    /// Directory holding cached repository indexes and plugin binaries.
    pub cache_dir: PathBuf,
    /// Refresh every repository index at startup, even when cached.
    pub force_update: bool,
    /// Declared plugin repositories, keyed by repository name.
    pub repositories: BTreeMap<String, RepositorySection>,
    /// What to do once a plugin keeps crashing.
    pub restart_policy: RestartPolicySection,
    /// Upper bound for the whole startup (index fetch, downloads, handshakes).
    pub startup_timeout_secs: u64,
    /// Upper bound for a single plugin handshake.
    pub handshake_timeout_secs: u64,
    /// Interval of the periodic liveness sweep over running plugins.
    pub health_check_interval_secs: u64,
    /// Upper bound for stopping every plugin at shutdown.
    pub shutdown_timeout_secs: u64,
    /// Environment variables forwarded to plugin processes when present.
    pub forward_env: Vec<String>,
}

impl Default for PluginsSection {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("botkube").join("plugins"),
            force_update: false,
            repositories: BTreeMap::new(),
            restart_policy: RestartPolicySection::default(),
            startup_timeout_secs: 300,
            handshake_timeout_secs: 60,
            health_check_interval_secs: 10,
            shutdown_timeout_secs: 10,
            forward_env: vec!["KUBECONFIG".to_owned()],
        }
    }
}

impl PluginsSection {
    /// Startup timeout as a [`Duration`].
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Handshake timeout as a [`Duration`].
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Health sweep interval as a [`Duration`].
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// Shutdown timeout as a [`Duration`].
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// A plugin repository declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositorySection {
    /// URL of the repository index (`https://`, `http://` or `file://`).
    pub url: String,
}

impl RepositorySection {
    /// Create a repository declaration for the given index URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// What happens once a plugin's restart count reaches the threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicyType {
    /// Leave the plugin deactivated and keep the agent running.
    #[default]
    DeactivatePlugin,
    /// Terminate the agent so the orchestrator restarts it fresh.
    RestartAgent,
}

/// Restart policy for crashed plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicySection {
    /// Policy kind.
    #[serde(rename = "type")]
    pub policy_type: RestartPolicyType,
    /// Number of restarts after which the policy applies.
    pub threshold: u32,
}

impl Default for RestartPolicySection {
    fn default() -> Self {
        Self {
            policy_type: RestartPolicyType::DeactivatePlugin,
            threshold: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Bindings
// ---------------------------------------------------------------------------

/// A single executor or source plugin binding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginBinding {
    /// Whether the plugin should be started.
    pub enabled: bool,
    /// Opaque plugin configuration, handed to the plugin on each call.
    pub config: toml::Table,
}

impl PluginBinding {
    /// An enabled binding with no plugin configuration.
    #[must_use]
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            config: toml::Table::new(),
        }
    }
}
