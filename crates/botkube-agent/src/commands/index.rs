//! Index generation command.

use std::path::Path;

use anyhow::{Context, Result};
use botkube_plugins::{IndexBuilder, PluginKind};
use tracing::info;

/// Build an index for the binaries in `bin_dir` and write it to `output`,
/// or to stdout when no output path is given.
pub(crate) fn build_index(
    bin_dir: &Path,
    url_base: &str,
    version: &str,
    output: Option<&Path>,
) -> Result<()> {
    let index = IndexBuilder::new(url_base, version)
        .build(bin_dir)
        .with_context(|| format!("building index from {}", bin_dir.display()))?;
    let yaml = index.to_yaml()?;

    let count = |kind: PluginKind| index.entries.iter().filter(|e| e.kind == kind).count();
    info!(
        executors = count(PluginKind::Executor),
        sources = count(PluginKind::Source),
        "index generated"
    );

    match output {
        Some(path) => std::fs::write(path, yaml)
            .with_context(|| format!("writing index to {}", path.display()))?,
        None => print!("{yaml}"),
    }
    Ok(())
}
