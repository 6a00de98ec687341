//! Cold-start orchestration and the request-path accessors.
//!
//! [`PluginManager::start`] resolves the enabled plugins against the cached
//! repository indexes, downloads missing binaries, launches every plugin and
//! publishes the clients into the per-kind stores. Afterwards the stores are
//! shared with the health monitor, which replaces crashed instances.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use botkube_config::{Config, RestartPolicySection};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::client::{Executor, PluginClient, Source};
use crate::download::{Downloader, temp_path};
use crate::error::{PluginError, PluginResult};
use crate::health::{HealthStats, HealthStatus};
use crate::index::{IndexUrl, Repository};
use crate::key::{EnabledKeys, PluginKey, PluginKind, collect_enabled_keys};
use crate::launcher::{LaunchRequest, LaunchedPlugin, Launcher};
use crate::lifecycle::{Cleanup, ProcessExit};
use crate::platform::Platform;
use crate::store::PluginStore;

/// Variable telling a plugin where its native dependencies live.
pub const DEPENDENCY_DIR_ENV: &str = "PLUGIN_DEPENDENCY_DIR";

/// Sub-directory of the cache holding native dependencies.
const DEPENDENCIES_DIR: &str = "dependencies";

/// Notification that one plugin instance exited without being asked to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    /// The crashed plugin.
    pub key: PluginKey,
    /// Generation of the crashed instance in its store.
    pub generation: u64,
}

/// Receiving ends of the per-kind crash channels.
#[derive(Debug)]
pub struct CrashReceivers {
    /// Executor crashes.
    pub executors: mpsc::UnboundedReceiver<CrashReport>,
    /// Source crashes.
    pub sources: mpsc::UnboundedReceiver<CrashReport>,
}

/// Where to cache the binary of `{repo}/{name}` at `version`.
#[must_use]
pub fn binary_path(
    cache_dir: &Path,
    repository: &str,
    kind: PluginKind,
    version: &str,
    name: &str,
) -> PathBuf {
    cache_dir
        .join(repository)
        .join(format!("{kind}_{version}_{name}"))
}

/// Where to cache the index of `repository`.
#[must_use]
pub fn index_path(cache_dir: &Path, repository: &str) -> PathBuf {
    cache_dir.join(format!("{repository}.yaml"))
}

/// A plugin key resolved against the loaded indexes.
#[derive(Debug, Clone)]
struct ResolvedPlugin {
    version: String,
    binary: PathBuf,
    url: IndexUrl,
}

/// Ties a client type to its store and crash channel.
pub(crate) trait ManagedKind: PluginClient {
    fn store(manager: &PluginManager) -> &PluginStore<Self>;
    fn crash_sender(manager: &PluginManager) -> &mpsc::UnboundedSender<CrashReport>;
}

impl ManagedKind for dyn Executor {
    fn store(manager: &PluginManager) -> &PluginStore<Self> {
        &manager.executors
    }

    fn crash_sender(manager: &PluginManager) -> &mpsc::UnboundedSender<CrashReport> {
        &manager.executor_crashes
    }
}

impl ManagedKind for dyn Source {
    fn store(manager: &PluginManager) -> &PluginStore<Self> {
        &manager.sources
    }

    fn crash_sender(manager: &PluginManager) -> &mpsc::UnboundedSender<CrashReport> {
        &manager.source_crashes
    }
}

/// Owns the plugin stores and everything needed to (re)launch plugins.
pub struct PluginManager {
    enabled: EnabledKeys,
    repositories: BTreeMap<String, String>,
    cache_dir: PathBuf,
    force_update: bool,
    platform: Platform,
    restart_policy: RestartPolicySection,
    call_timeout: Duration,
    health_check_interval: Duration,
    shutdown_timeout: Duration,

    downloader: Downloader,
    launcher: Arc<dyn Launcher>,
    indexes: RwLock<HashMap<String, Repository>>,

    executors: PluginStore<dyn Executor>,
    sources: PluginStore<dyn Source>,
    stats: HealthStats,

    started: tokio::sync::Mutex<bool>,
    ready: AtomicBool,
    closing: AtomicBool,

    executor_crashes: mpsc::UnboundedSender<CrashReport>,
    source_crashes: mpsc::UnboundedSender<CrashReport>,
    crash_receivers: Mutex<Option<CrashReceivers>>,
    watchers: TaskTracker,
    relaunches: TaskTracker,
}

impl PluginManager {
    /// Create a manager for the plugins enabled in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidConfig`] listing every malformed key or
    /// undeclared repository, or an error if the HTTP client cannot be built.
    pub fn new(config: &Config, launcher: Arc<dyn Launcher>) -> PluginResult<Self> {
        let enabled = collect_enabled_keys(config)?;
        let plugins = &config.plugins;
        let (executor_crashes, executor_rx) = mpsc::unbounded_channel();
        let (source_crashes, source_rx) = mpsc::unbounded_channel();

        Ok(Self {
            enabled,
            repositories: plugins
                .repositories
                .iter()
                .map(|(name, repo)| (name.clone(), repo.url.clone()))
                .collect(),
            cache_dir: plugins.cache_dir.clone(),
            force_update: plugins.force_update,
            platform: Platform::current(),
            restart_policy: plugins.restart_policy,
            call_timeout: plugins.handshake_timeout(),
            health_check_interval: plugins.health_check_interval(),
            shutdown_timeout: plugins.shutdown_timeout(),
            downloader: Downloader::new()?,
            launcher,
            indexes: RwLock::new(HashMap::new()),
            executors: PluginStore::new(),
            sources: PluginStore::new(),
            stats: HealthStats::new(plugins.restart_policy.threshold),
            started: tokio::sync::Mutex::new(false),
            ready: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            executor_crashes,
            source_crashes,
            crash_receivers: Mutex::new(Some(CrashReceivers {
                executors: executor_rx,
                sources: source_rx,
            })),
            watchers: TaskTracker::new(),
            relaunches: TaskTracker::new(),
        })
    }

    /// Resolve index URLs for another platform.
    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Download, launch and publish every enabled plugin.
    ///
    /// Runs once; later calls return immediately. Any failure, including
    /// cancellation through `cancel`, stops the plugins launched so far and
    /// aborts the whole start.
    ///
    /// # Errors
    ///
    /// Returns the first resolution, download or launch error, or
    /// [`PluginError::Cancelled`].
    pub async fn start(&self, cancel: &CancellationToken) -> PluginResult<()> {
        let mut started = self.started.lock().await;
        if *started {
            debug!("plugin manager already started");
            return Ok(());
        }

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(PluginError::Cancelled),
            result = self.start_all() => result,
        };

        match result {
            Ok(()) => {
                *started = true;
                self.ready.store(true, Ordering::Release);
                info!(
                    executors = self.executors.len(),
                    sources = self.sources.len(),
                    "plugin manager started"
                );
                Ok(())
            },
            Err(e) => {
                warn!(error = %e, "plugin startup failed, stopping launched plugins");
                self.stop_all().await;
                Err(e)
            },
        }
    }

    async fn start_all(&self) -> PluginResult<()> {
        if self.enabled.is_empty() {
            info!("no plugins enabled");
            return Ok(());
        }

        self.refresh_indexes(self.force_update).await?;
        for key in &self.enabled.executors {
            self.start_plugin::<dyn Executor>(key).await?;
        }
        for key in &self.enabled.sources {
            self.start_plugin::<dyn Source>(key).await?;
        }
        Ok(())
    }

    /// Load every repository index, fetching those not cached (or all of
    /// them when `force` is set).
    async fn refresh_indexes(&self, force: bool) -> PluginResult<()> {
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| PluginError::fs(&self.cache_dir, e))?;

        let mut loaded = HashMap::with_capacity(self.repositories.len());
        for (name, url) in &self.repositories {
            let path = index_path(&self.cache_dir, name);
            let cached = tokio::fs::try_exists(&path)
                .await
                .map_err(|e| PluginError::fs(&path, e))?;

            let repository = if force || !cached {
                info!(repository = %name, url = %url, "fetching repository index");
                let bytes = self.downloader.fetch_index(url).await?;
                let repository = Repository::from_index_bytes(name, &bytes)?;
                write_atomically(&path, &bytes).await?;
                repository
            } else {
                let bytes = tokio::fs::read(&path)
                    .await
                    .map_err(|e| PluginError::fs(&path, e))?;
                Repository::from_index_bytes(name, &bytes)?
            };

            debug!(
                repository = %name,
                executors = repository.plugin_count(PluginKind::Executor),
                sources = repository.plugin_count(PluginKind::Source),
                "repository index loaded"
            );
            loaded.insert(name.clone(), repository);
        }

        *self.indexes.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        Ok(())
    }

    async fn start_plugin<T: ManagedKind + ?Sized>(&self, key: &PluginKey) -> PluginResult<()> {
        let resolved = match self.prepare(T::KIND, key).await {
            Err(e) if e.is_not_found() || e.is_retryable() => {
                warn!(plugin = %key, error = %e, "refreshing repository indexes and retrying");
                self.refresh_indexes(true).await?;
                self.prepare(T::KIND, key).await?
            },
            other => other?,
        };
        self.launch_into_store::<T>(key, &resolved).await
    }

    /// Resolve `key` and make sure its binary and dependencies are cached.
    async fn prepare(&self, kind: PluginKind, key: &PluginKey) -> PluginResult<ResolvedPlugin> {
        let resolved = self.resolve(kind, key)?;

        if !path_exists(&resolved.binary).await? {
            info!(plugin = %key, version = %resolved.version, url = %resolved.url.url, "downloading plugin binary");
            self.downloader
                .fetch_binary(
                    &resolved.url.url,
                    &resolved.binary,
                    resolved.url.checksum.as_deref(),
                )
                .await?;
        }

        for (name, dependency) in &resolved.url.dependencies {
            let dest = self.dependency_dir().join(name);
            if !path_exists(&dest).await? {
                info!(plugin = %key, dependency = %name, "downloading plugin dependency");
                self.downloader
                    .fetch_binary(&dependency.url, &dest, dependency.checksum.as_deref())
                    .await?;
            }
        }

        Ok(resolved)
    }

    fn resolve(&self, kind: PluginKind, key: &PluginKey) -> PluginResult<ResolvedPlugin> {
        let not_found = || PluginError::NotFound {
            kind,
            key: key.to_string(),
        };

        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        let repository = indexes.get(key.repository()).ok_or_else(not_found)?;
        let entry = match key.version() {
            Some(version) => repository.find(kind, key.name(), version),
            None => repository
                .latest(kind, key.name())
                .or_else(|| repository.resolve(kind, key.name()).first()),
        }
        .ok_or_else(not_found)?;

        let url = entry
            .url_for(&self.platform)
            .ok_or_else(|| PluginError::MissingPlatform {
                key: key.to_string(),
                platform: self.platform.to_string(),
            })?;

        Ok(ResolvedPlugin {
            version: entry.version.clone(),
            binary: binary_path(
                &self.cache_dir,
                key.repository(),
                kind,
                &entry.version,
                key.name(),
            ),
            url: url.clone(),
        })
    }

    async fn launch_into_store<T: ManagedKind + ?Sized>(
        &self,
        key: &PluginKey,
        resolved: &ResolvedPlugin,
    ) -> PluginResult<()> {
        let LaunchedPlugin {
            client,
            cleanup,
            exit,
        } = self
            .launcher
            .launch(LaunchRequest {
                key: key.clone(),
                kind: T::KIND,
                binary: resolved.binary.clone(),
                env: vec![(
                    DEPENDENCY_DIR_ENV.to_owned(),
                    self.dependency_dir().display().to_string(),
                )],
            })
            .await?;

        let client = match T::from_dispensed(client) {
            Ok(client) => client,
            Err(other) => {
                cleanup.trigger();
                return Err(PluginError::UnexpectedClient {
                    key: key.to_string(),
                    expected: T::KIND,
                    actual: other.kind().to_string(),
                });
            },
        };

        // Stored before the metadata call so a cancelled start still finds
        // the instance to clean up.
        let store = T::store(self);
        let generation = store.insert(key.clone(), Arc::clone(&client), cleanup, exit.clone());
        self.stats.register(key);
        self.watch_exit::<T>(key.clone(), generation, exit);

        // Checked after the insert: a shutdown draining the store either
        // sees this instance or is already visible here.
        if self.closing.load(Ordering::SeqCst) {
            if let Some(entry) = store.remove_generation(key, generation) {
                await_exit(key.clone(), entry.cleanup, self.shutdown_timeout).await;
            }
            return Err(PluginError::Cancelled);
        }

        let metadata = match tokio::time::timeout(self.call_timeout, client.describe()).await {
            Ok(Ok(metadata)) => metadata,
            Ok(Err(e)) => return Err(self.retire(store, key, generation, e.to_string()).await),
            Err(_) => {
                let message = format!("no response within {}s", self.call_timeout.as_secs());
                return Err(self.retire(store, key, generation, message).await);
            },
        };

        info!(
            plugin = %key,
            kind = %T::KIND,
            version = %metadata.version,
            description = %metadata.description,
            generation,
            "plugin started"
        );
        Ok(())
    }

    async fn retire<T: ?Sized>(
        &self,
        store: &PluginStore<T>,
        key: &PluginKey,
        generation: u64,
        reason: String,
    ) -> PluginError {
        if let Some(entry) = store.remove_generation(key, generation) {
            await_exit(key.clone(), entry.cleanup, self.shutdown_timeout).await;
        }
        PluginError::LaunchFailed {
            key: key.to_string(),
            message: format!("fetching metadata: {reason}"),
        }
    }

    /// Forward the unrequested exit of one instance to the crash channel.
    fn watch_exit<T: ManagedKind + ?Sized>(
        &self,
        key: PluginKey,
        generation: u64,
        exit: ProcessExit,
    ) {
        let crashes = T::crash_sender(self).clone();
        self.watchers.spawn(async move {
            let report = exit.wait().await;
            if report.requested {
                debug!(plugin = %key, generation, "plugin stopped on request");
                return;
            }
            warn!(plugin = %key, kind = %T::KIND, code = ?report.code, generation, "plugin exited unexpectedly");
            let _ = crashes.send(CrashReport { key, generation });
        });
    }

    /// Launch a fresh instance of an enabled plugin whose binary is cached.
    ///
    /// Fails with [`PluginError::Cancelled`] once [`Self::shutdown`] began.
    pub(crate) async fn relaunch<T: ManagedKind + ?Sized>(
        &self,
        key: &PluginKey,
    ) -> PluginResult<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(PluginError::Cancelled);
        }
        self.relaunches
            .track_future(async {
                let resolved = self.prepare(T::KIND, key).await?;
                self.launch_into_store::<T>(key, &resolved).await
            })
            .await
    }

    /// Queue crash reports for instances that exited without a watcher
    /// noticing. Duplicates are discarded by generation downstream.
    pub(crate) fn report_unexpected_exits(&self) {
        for (key, generation) in self.executors.exited_unexpectedly() {
            let _ = self.executor_crashes.send(CrashReport { key, generation });
        }
        for (key, generation) in self.sources.exited_unexpectedly() {
            let _ = self.source_crashes.send(CrashReport { key, generation });
        }
    }

    /// The running executor named `name` (`repo/name` or `repo/name@version`).
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotStarted`] before a successful start,
    /// [`PluginError::Unavailable`] while an enabled plugin is recovering or
    /// deactivated, and [`PluginError::NotEnabled`] otherwise.
    pub fn get_executor(&self, name: &str) -> PluginResult<Arc<dyn Executor>> {
        self.get::<dyn Executor>(name)
    }

    /// The running source named `name`. Errors as [`Self::get_executor`].
    ///
    /// # Errors
    ///
    /// See [`Self::get_executor`].
    pub fn get_source(&self, name: &str) -> PluginResult<Arc<dyn Source>> {
        self.get::<dyn Source>(name)
    }

    fn get<T: ManagedKind + ?Sized>(&self, name: &str) -> PluginResult<Arc<T>> {
        if !self.ready.load(Ordering::Acquire) {
            return Err(PluginError::NotStarted);
        }
        let not_enabled = || PluginError::NotEnabled {
            kind: T::KIND,
            name: name.to_owned(),
        };
        let key = PluginKey::parse(name).map_err(|_| not_enabled())?;

        let store = T::store(self);
        if let Some(client) = store.get(&key) {
            return Ok(client);
        }
        if key.version().is_none()
            && let Some((_, client)) = store.find_plugin(&key)
        {
            return Ok(client);
        }

        let enabled = self
            .enabled
            .of(T::KIND)
            .iter()
            .find(|k| **k == key || (key.version().is_none() && k.same_plugin(&key)));
        match enabled {
            Some(enabled) => Err(PluginError::Unavailable {
                kind: T::KIND,
                key: enabled.to_string(),
            }),
            None => Err(not_enabled()),
        }
    }

    /// Enabled executor keys, sorted.
    #[must_use]
    pub fn executor_keys(&self) -> Vec<PluginKey> {
        self.enabled.executors.iter().cloned().collect()
    }

    /// Enabled source keys, sorted.
    #[must_use]
    pub fn source_keys(&self) -> Vec<PluginKey> {
        self.enabled.sources.iter().cloned().collect()
    }

    /// Health of every plugin started so far.
    #[must_use]
    pub fn health_statuses(&self) -> BTreeMap<PluginKey, HealthStatus> {
        self.stats.all()
    }

    /// Health of one plugin.
    #[must_use]
    pub fn health_status(&self, key: &PluginKey) -> Option<HealthStatus> {
        self.stats.status(key)
    }

    /// Restart bookkeeping.
    #[must_use]
    pub fn stats(&self) -> &HealthStats {
        &self.stats
    }

    /// The configured restart policy.
    #[must_use]
    pub fn restart_policy(&self) -> RestartPolicySection {
        self.restart_policy
    }

    /// Interval of the sweep for missed exits.
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        self.health_check_interval
    }

    /// Upper bound for waiting on plugin processes to exit.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Take the crash channels. Only the first caller gets them.
    pub fn take_crash_receivers(&self) -> Option<CrashReceivers> {
        self.crash_receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Stop every plugin and wait for the processes to exit, bounded by the
    /// shutdown timeout.
    ///
    /// Restarts still in flight are waited for; the instances they launch
    /// are stopped instead of published.
    pub async fn shutdown(&self) {
        self.ready.store(false, Ordering::Release);
        self.closing.store(true, Ordering::SeqCst);
        self.stop_all().await;

        self.relaunches.close();
        if tokio::time::timeout(self.shutdown_timeout, self.relaunches.wait())
            .await
            .is_err()
        {
            warn!("timed out waiting for in-flight plugin restarts");
        }

        self.watchers.close();
        if tokio::time::timeout(self.shutdown_timeout, self.watchers.wait())
            .await
            .is_err()
        {
            warn!("timed out waiting for plugin exit watchers");
        }
        info!("plugin manager stopped");
    }

    async fn stop_all(&self) {
        let tracker = TaskTracker::new();
        for (key, entry) in self.executors.drain() {
            tracker.spawn(await_exit(key, entry.cleanup, self.shutdown_timeout));
        }
        for (key, entry) in self.sources.drain() {
            tracker.spawn(await_exit(key, entry.cleanup, self.shutdown_timeout));
        }
        tracker.close();
        tracker.wait().await;
    }

    fn dependency_dir(&self) -> PathBuf {
        self.cache_dir.join(DEPENDENCIES_DIR)
    }
}

async fn await_exit(key: PluginKey, cleanup: Cleanup, limit: Duration) {
    match tokio::time::timeout(limit, cleanup.run()).await {
        Ok(report) => debug!(plugin = %key, code = ?report.code, "plugin process stopped"),
        Err(_) => warn!(plugin = %key, "plugin process did not exit in time"),
    }
}

async fn path_exists(path: &Path) -> PluginResult<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| PluginError::fs(path, e))
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> PluginResult<()> {
    let staged = temp_path(path);
    tokio::fs::write(&staged, bytes)
        .await
        .map_err(|e| PluginError::fs(&staged, e))?;
    tokio::fs::rename(&staged, path)
        .await
        .map_err(|e| PluginError::fs(path, e))
}
