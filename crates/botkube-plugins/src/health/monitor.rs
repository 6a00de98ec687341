//! The restart state machine.
//!
//! One loop per plugin kind consumes crash reports, so recoveries within a
//! kind are serialized while executors and sources recover in parallel. A
//! third loop periodically sweeps the stores for exits the watchers missed.

use std::sync::Arc;

use botkube_config::RestartPolicyType;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{Executor, Source};
use crate::error::PluginError;
use crate::key::{PluginKey, PluginKind};
use crate::manager::{CrashReport, ManagedKind, PluginManager};

/// What handling one crash report led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    /// The reported instance was already replaced or removed.
    Stale,
    /// A fresh instance is running.
    Relaunched,
    /// The threshold was reached and the plugin stays down.
    Deactivated,
    /// The threshold was reached and the agent was told to exit.
    Escalated,
    /// Relaunching failed and the plugin stays down.
    RelaunchFailed,
    /// The manager is shutting down, nothing was restarted.
    ShuttingDown,
}

/// Supervises plugin crashes and applies the restart policy.
pub struct HealthMonitor {
    manager: Arc<PluginManager>,
    scheduler: mpsc::Sender<PluginKey>,
    fatal: mpsc::Sender<PluginError>,
}

impl HealthMonitor {
    /// Create a monitor for `manager`.
    ///
    /// `scheduler` receives the key of every source plugin that was
    /// relaunched. `fatal` receives the error that should terminate the
    /// agent under [`RestartPolicyType::RestartAgent`].
    #[must_use]
    pub fn new(
        manager: Arc<PluginManager>,
        scheduler: mpsc::Sender<PluginKey>,
        fatal: mpsc::Sender<PluginError>,
    ) -> Self {
        Self {
            manager,
            scheduler,
            fatal,
        }
    }

    /// Supervise until `cancel` fires.
    ///
    /// Returns immediately if another monitor already took the crash
    /// channels of this manager.
    pub async fn run(self, cancel: CancellationToken) {
        let Some(receivers) = self.manager.take_crash_receivers() else {
            warn!("crash channels already taken, health monitor not started");
            return;
        };

        let monitor = Arc::new(self);
        let mut loops = JoinSet::new();
        loops.spawn(
            Arc::clone(&monitor).supervise::<dyn Executor>(receivers.executors, cancel.clone()),
        );
        loops.spawn(Arc::clone(&monitor).supervise::<dyn Source>(receivers.sources, cancel.clone()));
        loops.spawn(monitor.sweep(cancel));

        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "health monitor loop panicked");
            }
        }
    }

    async fn supervise<T: ManagedKind + ?Sized>(
        self: Arc<Self>,
        mut crashes: mpsc::UnboundedReceiver<CrashReport>,
        cancel: CancellationToken,
    ) {
        info!(kind = %T::KIND, "health monitor started");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                report = crashes.recv() => match report {
                    Some(report) => {
                        self.handle_crash::<T>(report).await;
                    },
                    None => break,
                },
            }
        }
        debug!(kind = %T::KIND, "health monitor stopped");
    }

    async fn sweep(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.manager.health_check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.manager.report_unexpected_exits(),
            }
        }
    }

    async fn handle_crash<T: ManagedKind + ?Sized>(&self, report: CrashReport) -> Recovery {
        let CrashReport { key, generation } = report;
        let Some(retired) = T::store(&self.manager).remove_generation(&key, generation) else {
            debug!(plugin = %key, generation, "ignoring crash report for a retired instance");
            return Recovery::Stale;
        };
        // Reaps the dead process; it is normally gone already.
        if tokio::time::timeout(self.manager.shutdown_timeout(), retired.cleanup.wait())
            .await
            .is_err()
        {
            warn!(plugin = %key, "crashed plugin process did not exit in time");
        }

        let stats = self.manager.stats();
        let policy = self.manager.restart_policy();
        let restarts = stats.increment(&key);

        if restarts >= stats.threshold() {
            return match policy.policy_type {
                RestartPolicyType::DeactivatePlugin => {
                    error!(
                        plugin = %key,
                        restarts,
                        "plugin reached its restart threshold, leaving it deactivated"
                    );
                    stats.mark_deactivated(&key);
                    Recovery::Deactivated
                },
                RestartPolicyType::RestartAgent => {
                    error!(
                        plugin = %key,
                        restarts,
                        "plugin reached its restart threshold, restarting the agent"
                    );
                    let fatal = PluginError::RestartThresholdReached {
                        key: key.to_string(),
                        restarts,
                    };
                    if self.fatal.send(fatal).await.is_err() {
                        error!("agent no longer listens for fatal plugin errors");
                    }
                    Recovery::Escalated
                },
            };
        }

        info!(plugin = %key, restarts, threshold = stats.threshold(), "restarting plugin");
        match self.manager.relaunch::<T>(&key).await {
            Ok(()) => {
                if T::KIND == PluginKind::Source && self.scheduler.send(key.clone()).await.is_err()
                {
                    warn!(plugin = %key, "scheduler is gone, relaunched source not announced");
                }
                Recovery::Relaunched
            },
            Err(PluginError::Cancelled) => {
                info!(plugin = %key, "plugin manager is shutting down, plugin not restarted");
                Recovery::ShuttingDown
            },
            Err(e) => {
                error!(plugin = %key, error = %e, "failed to restart plugin, deactivating it");
                stats.mark_deactivated(&key);
                Recovery::RelaunchFailed
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use botkube_config::{Config, RestartPolicySection};

    use super::*;
    use crate::health::PluginStatus;
    use crate::launcher::Launcher;
    use crate::testing::{FakeLauncher, TestRepo, enable, wait_until};

    struct Harness {
        _repo: TestRepo,
        manager: Arc<PluginManager>,
        launcher: Arc<FakeLauncher>,
        monitor: HealthMonitor,
        crashes: crate::manager::CrashReceivers,
        scheduled: mpsc::Receiver<PluginKey>,
        fatal: mpsc::Receiver<PluginError>,
    }

    async fn harness(
        policy: RestartPolicyType,
        threshold: u32,
        kind: PluginKind,
        name: &str,
    ) -> Harness {
        let mut repo = TestRepo::new();
        repo.publish(kind, name, "v1.0.0");
        let mut config: Config = repo.config();
        config.plugins.restart_policy = RestartPolicySection {
            policy_type: policy,
            threshold,
        };
        enable(&mut config, kind, &format!("botkube/{name}"));

        let launcher = Arc::new(FakeLauncher::new());
        let manager = Arc::new(
            PluginManager::new(&config, Arc::clone(&launcher) as Arc<dyn Launcher>).unwrap(),
        );
        manager.start(&CancellationToken::new()).await.unwrap();
        let crashes = manager.take_crash_receivers().unwrap();

        let (scheduler, scheduled) = mpsc::channel(8);
        let (fatal_tx, fatal) = mpsc::channel(1);
        Harness {
            _repo: repo,
            monitor: HealthMonitor::new(Arc::clone(&manager), scheduler, fatal_tx),
            manager,
            launcher,
            crashes,
            scheduled,
            fatal,
        }
    }

    impl Harness {
        /// Crash the running executor and handle the resulting report.
        async fn crash_executor(&mut self, key: &PluginKey) -> Recovery {
            assert!(self.launcher.crash(key));
            let report = self.crashes.executors.recv().await.unwrap();
            self.monitor.handle_crash::<dyn Executor>(report).await
        }
    }

    fn kubectl() -> PluginKey {
        PluginKey::new("botkube", "kubectl")
    }

    #[tokio::test]
    async fn deactivates_at_threshold() {
        let mut h =
            harness(RestartPolicyType::DeactivatePlugin, 3, PluginKind::Executor, "kubectl").await;
        let key = kubectl();

        assert_eq!(h.crash_executor(&key).await, Recovery::Relaunched);
        assert!(h.manager.get_executor("botkube/kubectl").is_ok());
        assert_eq!(h.crash_executor(&key).await, Recovery::Relaunched);
        assert_eq!(h.manager.health_status(&key).unwrap().restart_count, 2);
        assert_eq!(h.crash_executor(&key).await, Recovery::Deactivated);

        // Initial launch plus two restarts.
        assert_eq!(h.launcher.launch_count(&key), 3);
        assert!(matches!(
            h.manager.get_executor("botkube/kubectl"),
            Err(PluginError::Unavailable { .. })
        ));
        let status = h.manager.health_status(&key).unwrap();
        assert_eq!(status.status, PluginStatus::Deactivated);
        assert_eq!(status.restart_count, 3);

        // A fourth report finds nothing to recover and launches nothing.
        let fourth = CrashReport {
            key: key.clone(),
            generation: u64::MAX,
        };
        assert_eq!(
            h.monitor.handle_crash::<dyn Executor>(fourth).await,
            Recovery::Stale
        );
        assert_eq!(h.launcher.launch_count(&key), 3);
        assert_eq!(h.manager.health_status(&key).unwrap().restart_count, 3);
    }

    #[tokio::test]
    async fn escalates_at_threshold() {
        let mut h =
            harness(RestartPolicyType::RestartAgent, 2, PluginKind::Executor, "kubectl").await;
        let key = kubectl();

        assert_eq!(h.crash_executor(&key).await, Recovery::Relaunched);
        assert!(h.fatal.try_recv().is_err());
        assert_eq!(h.crash_executor(&key).await, Recovery::Escalated);

        let fatal = h.fatal.try_recv().unwrap();
        assert!(
            matches!(&fatal, PluginError::RestartThresholdReached { restarts: 2, .. }),
            "{fatal}"
        );
        assert_eq!(h.launcher.launch_count(&key), 2);
    }

    #[tokio::test]
    async fn relaunched_source_is_announced_once() {
        let mut h =
            harness(RestartPolicyType::DeactivatePlugin, 5, PluginKind::Source, "kubernetes").await;
        let key = PluginKey::new("botkube", "kubernetes");
        let before = h
            .manager
            .get_source("botkube/kubernetes")
            .unwrap()
            .metadata()
            .await
            .unwrap();

        assert!(h.launcher.crash(&key));
        let report = h.crashes.sources.recv().await.unwrap();
        assert_eq!(
            h.monitor.handle_crash::<dyn Source>(report).await,
            Recovery::Relaunched
        );

        let after = h
            .manager
            .get_source("botkube/kubernetes")
            .unwrap()
            .metadata()
            .await
            .unwrap();
        assert_ne!(before.description, after.description);
        assert_eq!(h.scheduled.try_recv().unwrap(), key);
        assert!(h.scheduled.try_recv().is_err());

        let status = h.manager.health_status(&key).unwrap();
        assert_eq!(status.status, PluginStatus::Running);
        assert_eq!(status.restart_count, 1);
    }

    #[tokio::test]
    async fn executor_relaunch_is_not_announced() {
        let mut h =
            harness(RestartPolicyType::DeactivatePlugin, 5, PluginKind::Executor, "kubectl").await;
        assert_eq!(h.crash_executor(&kubectl()).await, Recovery::Relaunched);
        assert!(h.scheduled.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_reports_recover_once() {
        let mut h =
            harness(RestartPolicyType::DeactivatePlugin, 5, PluginKind::Executor, "kubectl").await;
        let key = kubectl();

        assert!(h.launcher.crash(&key));
        let report = h.crashes.executors.recv().await.unwrap();
        assert_eq!(
            h.monitor.handle_crash::<dyn Executor>(report.clone()).await,
            Recovery::Relaunched
        );
        assert_eq!(
            h.monitor.handle_crash::<dyn Executor>(report).await,
            Recovery::Stale
        );
        assert_eq!(h.launcher.launch_count(&key), 2);
        assert_eq!(h.manager.health_status(&key).unwrap().restart_count, 1);
    }

    #[tokio::test]
    async fn failed_relaunch_deactivates() {
        let mut h =
            harness(RestartPolicyType::DeactivatePlugin, 5, PluginKind::Executor, "kubectl").await;
        let key = kubectl();
        h.launcher.fail_launches(&key);

        assert_eq!(h.crash_executor(&key).await, Recovery::RelaunchFailed);
        let status = h.manager.health_status(&key).unwrap();
        assert_eq!(status.status, PluginStatus::Deactivated);
        assert_eq!(status.restart_count, 1);
        assert!(matches!(
            h.manager.get_executor("botkube/kubectl"),
            Err(PluginError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn shutdown_during_restart_stops_the_new_instance() {
        let mut repo = TestRepo::new();
        repo.publish(PluginKind::Executor, "kubectl", "v1.0.0");
        let mut config = repo.config();
        enable(&mut config, PluginKind::Executor, "botkube/kubectl");
        let launcher =
            Arc::new(FakeLauncher::new().with_launch_delay(Duration::from_millis(300)));
        let manager = Arc::new(
            PluginManager::new(&config, Arc::clone(&launcher) as Arc<dyn Launcher>).unwrap(),
        );
        let mut crashes = manager.take_crash_receivers().unwrap();
        manager.start(&CancellationToken::new()).await.unwrap();

        let (scheduler, _scheduled) = mpsc::channel(8);
        let (fatal, _fatal_rx) = mpsc::channel(1);
        let monitor = HealthMonitor::new(Arc::clone(&manager), scheduler, fatal);

        let key = kubectl();
        assert!(launcher.crash(&key));
        let report = crashes.executors.recv().await.unwrap();
        let recovery =
            tokio::spawn(async move { monitor.handle_crash::<dyn Executor>(report).await });

        wait_until("crashed instance retired", || {
            matches!(
                manager.get_executor("botkube/kubectl"),
                Err(PluginError::Unavailable { .. })
            )
        })
        .await;
        // The replacement is now inside its launch delay.
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.shutdown().await;

        assert_eq!(launcher.running(), 0);
        assert_eq!(recovery.await.unwrap(), Recovery::ShuttingDown);
        assert_eq!(launcher.running(), 0);
        assert!(matches!(
            manager.get_executor("botkube/kubectl"),
            Err(PluginError::NotStarted)
        ));
        assert_eq!(
            manager.health_status(&key).unwrap().status,
            PluginStatus::Running
        );
    }

    #[tokio::test]
    async fn run_recovers_until_cancelled() {
        let repo_kind = PluginKind::Source;
        let mut repo = TestRepo::new();
        repo.publish(repo_kind, "kubernetes", "v1.0.0");
        let mut config = repo.config();
        config.plugins.health_check_interval_secs = 1;
        enable(&mut config, repo_kind, "botkube/kubernetes");

        let launcher = Arc::new(FakeLauncher::new());
        let manager = Arc::new(
            PluginManager::new(&config, Arc::clone(&launcher) as Arc<dyn Launcher>).unwrap(),
        );
        manager.start(&CancellationToken::new()).await.unwrap();

        let (scheduler, mut scheduled) = mpsc::channel(8);
        let (fatal, _fatal_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let monitor = tokio::spawn(
            HealthMonitor::new(Arc::clone(&manager), scheduler, fatal).run(cancel.clone()),
        );

        let key = PluginKey::new("botkube", "kubernetes");
        wait_until("initial launch", || launcher.launch_count(&key) == 1).await;
        assert!(launcher.crash(&key));
        let announced = tokio::time::timeout(Duration::from_secs(5), scheduled.recv())
            .await
            .unwrap();
        assert_eq!(announced, Some(key.clone()));
        assert_eq!(launcher.launch_count(&key), 2);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), monitor)
            .await
            .unwrap()
            .unwrap();
        manager.shutdown().await;
        assert_eq!(launcher.running(), 0);
    }
}
