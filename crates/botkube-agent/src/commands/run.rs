//! Agent run command.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use botkube_config::Config;
use botkube_plugins::{HealthMonitor, PluginError, PluginManager, ProcessLauncher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::dispatch::{SourceDispatcher, source_configs};

/// Buffered relaunch announcements between the health monitor and the
/// source dispatcher.
const SCHEDULER_CAPACITY: usize = 16;

/// Run the agent until interrupted or until the restart policy asks for an
/// agent restart.
pub(crate) async fn run_agent(config: &Config) -> Result<()> {
    let configs = source_configs(config)?;
    let manager = Arc::new(
        PluginManager::new(config, Arc::new(ProcessLauncher::from_config(&config.plugins)))
            .context("configuring plugin manager")?,
    );

    start_plugins(&manager, config.plugins.startup_timeout()).await?;

    let cancel = CancellationToken::new();
    let (scheduler_tx, scheduler_rx) = mpsc::channel(SCHEDULER_CAPACITY);
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<PluginError>(1);

    let tasks = TaskTracker::new();
    tasks.spawn(
        HealthMonitor::new(Arc::clone(&manager), scheduler_tx, fatal_tx).run(cancel.clone()),
    );
    tasks.spawn(SourceDispatcher::new(Arc::clone(&manager), configs).run(scheduler_rx, cancel.clone()));
    tasks.close();

    info!("agent running (Ctrl+C to stop)");
    let fatal = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            None
        },
        Some(err) = fatal_rx.recv() => {
            error!(error = %err, "restart policy requires an agent restart");
            Some(err)
        },
    };

    cancel.cancel();
    manager.shutdown().await;
    if tokio::time::timeout(manager.shutdown_timeout(), tasks.wait())
        .await
        .is_err()
    {
        warn!("timed out waiting for background tasks");
    }

    match fatal {
        Some(err) => Err(anyhow::Error::new(err).context("agent stopped by restart policy")),
        None => {
            info!("agent stopped");
            Ok(())
        },
    }
}

/// Start every enabled plugin, giving up after `timeout` or on Ctrl+C.
///
/// Plugins launched before the deadline are stopped again on failure.
pub(crate) async fn start_plugins(manager: &PluginManager, timeout: Duration) -> Result<()> {
    let startup = CancellationToken::new();
    let watchdog = tokio::spawn({
        let startup = startup.clone();
        async move {
            tokio::select! {
                () = tokio::time::sleep(timeout) => {
                    warn!(timeout_secs = timeout.as_secs(), "plugin startup deadline exceeded");
                },
                _ = tokio::signal::ctrl_c() => info!("interrupted during plugin startup"),
            }
            startup.cancel();
        }
    });

    let result = manager.start(&startup).await;
    watchdog.abort();
    result.context("starting plugins")
}
