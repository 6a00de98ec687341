//! Build an index from a directory of plugin binaries.
//!
//! Artifacts are named `{kind}_{name}_{os}_{arch}` with an optional `.exe`
//! suffix, e.g. `executor_kubectl_linux_amd64`.

use std::collections::BTreeMap;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::debug;

use super::{Index, IndexEntry, IndexPlatform, IndexUrl};
use crate::error::{PluginError, PluginResult};
use crate::key::PluginKind;

/// Generates an [`Index`] for a directory of released binaries.
#[derive(Debug, Clone)]
pub struct IndexBuilder {
    url_base: String,
    version: String,
}

/// A parsed artifact file name.
#[derive(Debug, PartialEq, Eq)]
struct Artifact<'a> {
    kind: PluginKind,
    name: &'a str,
    os: &'a str,
    arch: &'a str,
}

impl IndexBuilder {
    /// Builder producing URLs under `url_base`, all entries at `version`.
    #[must_use]
    pub fn new(url_base: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            url_base: url_base.into(),
            version: version.into(),
        }
    }

    /// Scan `bin_dir` and group artifacts into one entry per plugin.
    ///
    /// Hidden files and non-files are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::MalformedArtifact`] naming the first file that
    /// does not follow the naming convention, or an I/O error if the
    /// directory or a binary cannot be read.
    pub fn build(&self, bin_dir: &Path) -> PluginResult<Index> {
        let mut grouped: BTreeMap<(PluginKind, String), Vec<IndexUrl>> = BTreeMap::new();

        let mut files = Vec::new();
        for entry in std::fs::read_dir(bin_dir).map_err(|e| PluginError::fs(bin_dir, e))? {
            let entry = entry.map_err(|e| PluginError::fs(bin_dir, e))?;
            let file_type = entry.file_type().map_err(|e| PluginError::fs(entry.path(), e))?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if !file_type.is_file() || file_name.starts_with('.') {
                debug!(file = %file_name, "skipping non-artifact entry");
                continue;
            }
            files.push((file_name, entry.path()));
        }
        files.sort();

        for (file_name, path) in files {
            let artifact = parse_artifact_name(&file_name)?;
            let bytes = std::fs::read(&path).map_err(|e| PluginError::fs(&path, e))?;

            grouped
                .entry((artifact.kind, artifact.name.to_owned()))
                .or_default()
                .push(IndexUrl {
                    url: format!("{}/{file_name}", self.url_base.trim_end_matches('/')),
                    checksum: Some(format!("sha256:{}", hex::encode(Sha256::digest(&bytes)))),
                    platform: IndexPlatform {
                        os: artifact.os.to_owned(),
                        architecture: artifact.arch.to_owned(),
                    },
                    dependencies: BTreeMap::new(),
                });
        }

        let entries = grouped
            .into_iter()
            .map(|((kind, name), mut urls)| {
                urls.sort_by(|a, b| a.platform.cmp(&b.platform));
                IndexEntry {
                    name,
                    kind,
                    description: String::new(),
                    version: self.version.clone(),
                    json_schema: None,
                    urls,
                }
            })
            .collect();

        Ok(Index { entries })
    }
}

fn parse_artifact_name(file_name: &str) -> PluginResult<Artifact<'_>> {
    let malformed = |reason: String| PluginError::MalformedArtifact {
        file: file_name.to_owned(),
        reason,
    };

    let stem = file_name.strip_suffix(".exe").unwrap_or(file_name);
    let parts: Vec<&str> = stem.split('_').collect();
    let &[kind, name, os, arch] = parts.as_slice() else {
        return Err(malformed(format!(
            "expected 4 '_'-separated segments ({{kind}}_{{name}}_{{os}}_{{arch}}), found {}",
            parts.len()
        )));
    };

    if [kind, name, os, arch].iter().any(|s| s.is_empty()) {
        return Err(malformed("empty segment".to_owned()));
    }

    let kind = PluginKind::from_name(kind)
        .ok_or_else(|| malformed(format!("unknown plugin kind '{kind}'")))?;

    Ok(Artifact {
        kind,
        name,
        os,
        arch,
    })
}
