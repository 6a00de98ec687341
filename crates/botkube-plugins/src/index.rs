//! Repository index: format, version ordering and lookup.
//!
//! An index is a YAML document listing every published plugin version with
//! its per-platform download URLs. A [`Repository`] is the immutable,
//! version-sorted view built from one index.

mod builder;

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};
use crate::key::PluginKind;
use crate::platform::Platform;

pub use builder::IndexBuilder;

/// A repository index document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Index {
    /// Every published plugin version.
    #[serde(default)]
    pub entries: Vec<IndexEntry>,
}

impl Index {
    /// Parse an index from YAML bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::IndexParse`] if the document is malformed.
    pub fn from_yaml(repository: &str, bytes: &[u8]) -> PluginResult<Self> {
        serde_yaml::from_slice(bytes).map_err(|e| PluginError::IndexParse {
            repository: repository.to_owned(),
            message: e.to_string(),
        })
    }

    /// Render the index as YAML.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::IndexParse`] if serialization fails.
    pub fn to_yaml(&self) -> PluginResult<String> {
        serde_yaml::to_string(self).map_err(|e| PluginError::IndexParse {
            repository: "<generated>".to_owned(),
            message: e.to_string(),
        })
    }
}

/// One published version of a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    /// Plugin name.
    pub name: String,
    /// Plugin kind.
    #[serde(rename = "type")]
    pub kind: PluginKind,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Version as published (`v1.5.0`, `1.5.0`, ...).
    pub version: String,
    /// JSON schema of the plugin configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<serde_json::Value>,
    /// Download locations, one per platform.
    #[serde(default)]
    pub urls: Vec<IndexUrl>,
}

impl IndexEntry {
    /// The download for the given platform, if published.
    #[must_use]
    pub fn url_for(&self, platform: &Platform) -> Option<&IndexUrl> {
        self.urls
            .iter()
            .find(|u| u.platform.os == platform.os && u.platform.architecture == platform.arch)
    }
}

/// A platform-specific plugin binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexUrl {
    /// Download URL.
    pub url: String,
    /// Expected `sha256:<hex>` digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Target platform.
    pub platform: IndexPlatform,
    /// Native tools the plugin needs, keyed by tool name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, Dependency>,
}

/// Platform selector inside an index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexPlatform {
    /// Operating system.
    pub os: String,
    /// CPU architecture.
    pub architecture: String,
}

/// A native dependency download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Download URL.
    pub url: String,
    /// Expected `sha256:<hex>` digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Parse a version leniently: surrounding whitespace, a leading `v`/`V`
/// and letter case are ignored.
#[must_use]
pub fn parse_version(raw: &str) -> Option<semver::Version> {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix(['v', 'V'])
        .unwrap_or(trimmed)
        .to_ascii_lowercase();
    semver::Version::parse(&trimmed).ok()
}

/// Order two versions ascending. Unparsable versions sort below every
/// parsable one and compare equal to each other.
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (parse_version(a), parse_version(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

/// Whether two version strings denote the same version.
#[must_use]
pub fn versions_match(a: &str, b: &str) -> bool {
    match (parse_version(a), parse_version(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a.trim().eq_ignore_ascii_case(b.trim()),
    }
}

/// Version-sorted snapshot of one repository index.
#[derive(Debug, Clone, Default)]
pub struct Repository {
    name: String,
    executors: HashMap<String, Vec<IndexEntry>>,
    sources: HashMap<String, Vec<IndexEntry>>,
}

impl Repository {
    /// Build a repository from a parsed index.
    #[must_use]
    pub fn from_index(name: impl Into<String>, index: Index) -> Self {
        let mut repo = Self {
            name: name.into(),
            ..Self::default()
        };

        for entry in index.entries {
            repo.entries_mut(entry.kind)
                .entry(entry.name.clone())
                .or_default()
                .push(entry);
        }

        for versions in repo.executors.values_mut().chain(repo.sources.values_mut()) {
            // Stable sort keeps unparsable versions in index order at the end.
            versions.sort_by(|a, b| compare_versions(&b.version, &a.version));
        }

        repo
    }

    /// Parse YAML index bytes into a repository.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::IndexParse`] if the index is malformed.
    pub fn from_index_bytes(name: &str, bytes: &[u8]) -> PluginResult<Self> {
        Ok(Self::from_index(name, Index::from_yaml(name, bytes)?))
    }

    /// Repository name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every version of a plugin, newest first.
    #[must_use]
    pub fn resolve(&self, kind: PluginKind, name: &str) -> &[IndexEntry] {
        self.entries(kind).get(name).map_or(&[], Vec::as_slice)
    }

    /// The newest version with a parsable version string.
    #[must_use]
    pub fn latest(&self, kind: PluginKind, name: &str) -> Option<&IndexEntry> {
        self.resolve(kind, name)
            .iter()
            .find(|e| parse_version(&e.version).is_some())
    }

    /// A specific version of a plugin.
    #[must_use]
    pub fn find(&self, kind: PluginKind, name: &str, version: &str) -> Option<&IndexEntry> {
        self.resolve(kind, name)
            .iter()
            .find(|e| versions_match(&e.version, version))
    }

    /// Number of distinct plugins of a kind.
    #[must_use]
    pub fn plugin_count(&self, kind: PluginKind) -> usize {
        self.entries(kind).len()
    }

    fn entries(&self, kind: PluginKind) -> &HashMap<String, Vec<IndexEntry>> {
        match kind {
            PluginKind::Executor => &self.executors,
            PluginKind::Source => &self.sources,
        }
    }

    fn entries_mut(&mut self, kind: PluginKind) -> &mut HashMap<String, Vec<IndexEntry>> {
        match kind {
            PluginKind::Executor => &mut self.executors,
            PluginKind::Source => &mut self.sources,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r"
entries:
  - name: kubectl
    type: executor
    description: Run kubectl commands
    version: v1.0.0
    urls:
      - url: https://example.com/v1.0.0/executor_kubectl_linux_amd64
        platform: { os: linux, architecture: amd64 }
  - name: kubectl
    type: executor
    version: latest-dev
    urls: []
  - name: kubectl
    type: executor
    description: Run kubectl commands
    version: V1.5.0
    jsonSchema:
      type: object
    urls:
      - url: https://example.com/v1.5.0/executor_kubectl_linux_amd64
        checksum: sha256:00
        platform: { os: linux, architecture: amd64 }
        dependencies:
          kubectl:
            url: https://example.com/kubectl
      - url: https://example.com/v1.5.0/executor_kubectl_darwin_arm64
        platform: { os: darwin, architecture: arm64 }
  - name: kubectl
    type: executor
    version: 1.2.0
  - name: kubernetes
    type: source
    version: v0.3.0
";

    #[test]
    fn entries_are_sorted_descending() {
        let repo = Repository::from_index_bytes("botkube", INDEX.as_bytes()).unwrap();
        let versions: Vec<&str> = repo
            .resolve(PluginKind::Executor, "kubectl")
            .iter()
            .map(|e| e.version.as_str())
            .collect();
        assert_eq!(versions, vec!["V1.5.0", "1.2.0", "v1.0.0", "latest-dev"]);
        assert_eq!(repo.plugin_count(PluginKind::Executor), 1);
        assert_eq!(repo.plugin_count(PluginKind::Source), 1);
        assert_eq!(repo.name(), "botkube");
    }

    #[test]
    fn latest_and_find() {
        let repo = Repository::from_index_bytes("botkube", INDEX.as_bytes()).unwrap();

        let latest = repo.latest(PluginKind::Executor, "kubectl").unwrap();
        assert_eq!(latest.version, "V1.5.0");
        assert!(latest.json_schema.is_some());

        let pinned = repo.find(PluginKind::Executor, "kubectl", "1.0.0").unwrap();
        assert_eq!(pinned.version, "v1.0.0");
        assert!(repo.find(PluginKind::Executor, "kubectl", "v9.9.9").is_none());

        // Kinds are separate namespaces.
        assert!(repo.latest(PluginKind::Source, "kubectl").is_none());
        assert!(repo.resolve(PluginKind::Executor, "helm").is_empty());
    }

    #[test]
    fn latest_skips_unparsable_versions() {
        let index = Index {
            entries: vec![IndexEntry {
                name: "echo".into(),
                kind: PluginKind::Executor,
                description: String::new(),
                version: "nightly".into(),
                json_schema: None,
                urls: Vec::new(),
            }],
        };
        let repo = Repository::from_index("local", index);
        assert_eq!(repo.resolve(PluginKind::Executor, "echo").len(), 1);
        assert!(repo.latest(PluginKind::Executor, "echo").is_none());
    }

    #[test]
    fn url_for_platform() {
        let repo = Repository::from_index_bytes("botkube", INDEX.as_bytes()).unwrap();
        let latest = repo.latest(PluginKind::Executor, "kubectl").unwrap();

        let url = latest.url_for(&Platform::new("linux", "amd64")).unwrap();
        assert!(url.url.ends_with("executor_kubectl_linux_amd64"));
        assert_eq!(url.dependencies.len(), 1);
        assert!(latest.url_for(&Platform::new("windows", "amd64")).is_none());
    }

    #[test]
    fn version_comparison() {
        assert_eq!(compare_versions("v1.2.0", "1.10.0"), Ordering::Less);
        assert_eq!(compare_versions("V2.0.0", "v2.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.0.0-RC.1", "1.0.0"), Ordering::Less);
        assert_eq!(compare_versions("garbage", "v0.0.1"), Ordering::Less);
        assert_eq!(compare_versions("v0.0.1", "garbage"), Ordering::Greater);
        assert_eq!(compare_versions("foo", "bar"), Ordering::Equal);
        assert!(versions_match("v1.5.0", "1.5.0"));
        assert!(versions_match("dev", "DEV"));
    }

    #[test]
    fn malformed_index_is_an_error() {
        let err = Repository::from_index_bytes("broken", b"entries: [ { name: 1 ").unwrap_err();
        assert!(matches!(err, PluginError::IndexParse { ref repository, .. } if repository == "broken"));
    }
}
