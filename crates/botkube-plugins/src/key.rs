//! Plugin kinds and keys.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use botkube_config::Config;
use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};

/// The two kinds of plugins the agent runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    /// Synchronous command handler, pulled per incoming command.
    Executor,
    /// Event emitter, consumed by the scheduler.
    Source,
}

impl PluginKind {
    /// Every kind, in startup order.
    pub const ALL: [Self; 2] = [Self::Executor, Self::Source];

    /// Lowercase name used in index files, artifact names and the handshake.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Executor => "executor",
            Self::Source => "source",
        }
    }

    /// Parse a lowercase kind name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "executor" => Some(Self::Executor),
            "source" => Some(Self::Source),
            _ => None,
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a plugin: `repository/name[@version]`.
///
/// A key without a version resolves to the latest entry in the index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PluginKey {
    repository: String,
    name: String,
    version: Option<String>,
}

impl PluginKey {
    /// Create an unversioned key.
    #[must_use]
    pub fn new(repository: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            name: name.into(),
            version: None,
        }
    }

    /// Pin the key to a version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Parse `repository/name` or `repository/name@version`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidKey`] listing every problem found.
    pub fn parse(input: &str) -> PluginResult<Self> {
        let mut violations = Vec::new();

        let (path, version) = match input.split_once('@') {
            Some((path, version)) => (path, Some(version)),
            None => (input, None),
        };

        let (repository, name) = path.split_once('/').unwrap_or_else(|| {
            violations.push("missing '/' between repository and name".to_owned());
            ("", "")
        });

        if repository.trim().is_empty() {
            violations.push("repository name is empty".to_owned());
        }
        if name.trim().is_empty() {
            violations.push("plugin name is empty".to_owned());
        } else if name.contains('/') {
            violations.push(format!("plugin name '{name}' must not contain '/'"));
        }
        if version.is_some_and(|v| v.trim().is_empty()) {
            violations.push("version after '@' is empty".to_owned());
        }

        if !violations.is_empty() {
            return Err(PluginError::InvalidKey {
                input: input.to_owned(),
                violations,
            });
        }

        Ok(Self {
            repository: repository.to_owned(),
            name: name.to_owned(),
            version: version.map(str::to_owned),
        })
    }

    /// Repository the plugin is published in.
    #[must_use]
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Plugin name within the repository.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pinned version, if any.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// The same key without a version.
    #[must_use]
    pub fn unversioned(&self) -> Self {
        Self::new(self.repository.clone(), self.name.clone())
    }

    /// Whether both keys name the same plugin, ignoring versions.
    #[must_use]
    pub fn same_plugin(&self, other: &Self) -> bool {
        self.repository == other.repository && self.name == other.name
    }
}

impl fmt::Display for PluginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.repository, self.name)?;
        if let Some(version) = &self.version {
            write!(f, "@{version}")?;
        }
        Ok(())
    }
}

impl FromStr for PluginKey {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// The enabled plugin keys of each kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnabledKeys {
    /// Enabled executor plugins.
    pub executors: BTreeSet<PluginKey>,
    /// Enabled source plugins.
    pub sources: BTreeSet<PluginKey>,
}

impl EnabledKeys {
    /// Whether no plugin of any kind is enabled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.executors.is_empty() && self.sources.is_empty()
    }

    /// Enabled keys of one kind.
    #[must_use]
    pub fn of(&self, kind: PluginKind) -> &BTreeSet<PluginKey> {
        match kind {
            PluginKind::Executor => &self.executors,
            PluginKind::Source => &self.sources,
        }
    }
}

/// Parse every enabled plugin key in the configuration.
///
/// Each key must parse and its repository must be declared under
/// `plugins.repositories`. Keys enabled in several binding groups collapse
/// to one.
///
/// # Errors
///
/// Returns [`PluginError::InvalidConfig`] listing every violation across
/// both kinds.
pub fn collect_enabled_keys(config: &Config) -> PluginResult<EnabledKeys> {
    let mut violations = Vec::new();
    let mut enabled = EnabledKeys::default();

    for (kind, raw_keys) in [
        (PluginKind::Executor, config.enabled_executor_keys()),
        (PluginKind::Source, config.enabled_source_keys()),
    ] {
        for raw in raw_keys {
            match PluginKey::parse(raw) {
                Ok(key) => {
                    if !config.plugins.repositories.contains_key(key.repository()) {
                        violations.push(format!(
                            "{kind} '{raw}': repository '{}' is not declared under plugins.repositories",
                            key.repository()
                        ));
                    }
                    match kind {
                        PluginKind::Executor => enabled.executors.insert(key),
                        PluginKind::Source => enabled.sources.insert(key),
                    };
                },
                Err(PluginError::InvalidKey {
                    violations: found, ..
                }) => {
                    violations.extend(found.into_iter().map(|v| format!("{kind} '{raw}': {v}")));
                },
                Err(other) => violations.push(format!("{kind} '{raw}': {other}")),
            }
        }
    }

    if violations.is_empty() {
        Ok(enabled)
    } else {
        Err(PluginError::InvalidConfig { violations })
    }
}

#[cfg(test)]
mod tests {
    use botkube_config::{PluginBinding, RepositorySection};

    use super::*;

    #[test]
    fn parse_round_trips() {
        for raw in ["botkube/kubectl", "botkube/kubectl@v1.5.0", "repo/a-b@1.0.0-rc.1"] {
            let key = PluginKey::parse(raw).unwrap();
            assert_eq!(key.to_string(), raw);
            assert_eq!(PluginKey::parse(&key.to_string()).unwrap(), key);
        }
    }

    #[test]
    fn parse_parts() {
        let key: PluginKey = "botkube/helm@v0.2.0".parse().unwrap();
        assert_eq!(key.repository(), "botkube");
        assert_eq!(key.name(), "helm");
        assert_eq!(key.version(), Some("v0.2.0"));
        assert_eq!(key.unversioned(), PluginKey::new("botkube", "helm"));
        assert!(key.same_plugin(&PluginKey::new("botkube", "helm")));
    }

    #[test]
    fn parse_reports_every_violation() {
        let err = PluginKey::parse("/@").unwrap_err();
        let PluginError::InvalidKey { violations, .. } = err else {
            panic!("expected InvalidKey");
        };
        assert_eq!(violations.len(), 3, "{violations:?}");

        let err = PluginKey::parse("kubectl").unwrap_err();
        let PluginError::InvalidKey { violations, .. } = err else {
            panic!("expected InvalidKey");
        };
        // Missing separator, then both parts reported missing.
        assert_eq!(violations.len(), 3, "{violations:?}");
        assert!(violations.iter().any(|v| v.contains("repository")));
        assert!(violations.iter().any(|v| v.contains("plugin name")));
    }

    #[test]
    fn rejects_nested_name() {
        assert!(PluginKey::parse("botkube/a/b").is_err());
    }

    fn config_with(executors: &[&str], sources: &[&str]) -> Config {
        let mut config = Config::default();
        config
            .plugins
            .repositories
            .insert("botkube".into(), RepositorySection::new("file:///tmp/index.yaml"));
        for raw in executors {
            config
                .executors
                .entry("tools".into())
                .or_default()
                .insert((*raw).into(), PluginBinding::enabled());
        }
        for raw in sources {
            config
                .sources
                .entry("events".into())
                .or_default()
                .insert((*raw).into(), PluginBinding::enabled());
        }
        config
    }

    #[test]
    fn collect_enabled_keys_dedupes_across_groups() {
        let mut config = config_with(&["botkube/kubectl"], &["botkube/kubernetes@v1.0.0"]);
        config
            .executors
            .entry("other".into())
            .or_default()
            .insert("botkube/kubectl".into(), PluginBinding::enabled());

        let enabled = collect_enabled_keys(&config).unwrap();
        assert_eq!(enabled.executors.len(), 1);
        assert_eq!(
            enabled.sources.iter().next().unwrap().version(),
            Some("v1.0.0")
        );
        assert!(!enabled.is_empty());
    }

    #[test]
    fn collect_enabled_keys_lists_all_violations() {
        let config = config_with(&["kubectl", "other/helm"], &["botkube/"]);

        let err = collect_enabled_keys(&config).unwrap_err();
        let PluginError::InvalidConfig { violations } = &err else {
            panic!("expected InvalidConfig, got {err:?}");
        };
        // "kubectl": separator + repository + name; "other/helm": undeclared
        // repository; "botkube/": empty name.
        assert_eq!(violations.len(), 5, "{violations:?}");
        assert!(err.to_string().contains("repository 'other' is not declared"));
        assert!(err.to_string().contains("source 'botkube/'"));
    }
}
