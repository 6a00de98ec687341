//! One-shot plugin check.

use std::sync::Arc;

use anyhow::{Context, Result};
use botkube_config::Config;
use botkube_plugins::{Executor, PluginManager, PluginResult, ProcessLauncher, Source};

use super::run::start_plugins;

/// Start every enabled plugin, print what it reports and stop it again.
pub(crate) async fn check_plugins(config: &Config) -> Result<()> {
    let manager = PluginManager::new(config, Arc::new(ProcessLauncher::from_config(&config.plugins)))
        .context("configuring plugin manager")?;
    start_plugins(&manager, config.plugins.startup_timeout()).await?;

    let result = report(&manager).await;
    manager.shutdown().await;
    result.context("describing plugins")
}

async fn report(manager: &PluginManager) -> PluginResult<()> {
    let statuses = manager.health_statuses();
    if statuses.is_empty() {
        println!("No plugins enabled");
        return Ok(());
    }

    for key in manager.executor_keys() {
        let metadata = manager.get_executor(&key.to_string())?.metadata().await?;
        println!("executor  {key}  {}  {}", metadata.version, metadata.description);
    }
    for key in manager.source_keys() {
        let metadata = manager.get_source(&key.to_string())?.metadata().await?;
        println!("source    {key}  {}  {}", metadata.version, metadata.description);
    }

    println!();
    for (key, status) in statuses {
        println!(
            "{key}: {} (restarts {}/{})",
            status.status, status.restart_count, status.threshold
        );
    }
    Ok(())
}
