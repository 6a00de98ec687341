//! In-memory launcher and repository fixtures for runtime tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use botkube_config::{Config, PluginBinding, RepositorySection};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};

use crate::client::{
    DispensedClient, ExecuteInput, ExecuteOutput, Executor, Metadata, Source, SourceEvent,
    StreamInput,
};
use crate::error::{PluginError, PluginResult};
use crate::index::{Index, IndexEntry, IndexPlatform, IndexUrl};
use crate::key::{PluginKey, PluginKind};
use crate::launcher::{LaunchRequest, LaunchedPlugin, Launcher};
use crate::lifecycle::{ProcessExit, lifecycle};
use crate::platform::Platform;

/// Name of the repository every fixture publishes into.
pub(crate) const REPO: &str = "botkube";

/// Launcher that dispenses in-memory clients instead of processes.
#[derive(Default)]
pub(crate) struct FakeLauncher {
    state: Mutex<FakeState>,
    launch_delay: Duration,
}

#[derive(Default)]
struct FakeState {
    launches: Vec<LaunchRequest>,
    crash_switches: HashMap<PluginKey, oneshot::Sender<()>>,
    exits: Vec<ProcessExit>,
    failing: HashSet<PluginKey>,
    dispense_as: HashMap<PluginKey, PluginKind>,
    next_instance: u64,
}

impl FakeLauncher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Launch requests seen for `key`.
    pub(crate) fn launches(&self, key: &PluginKey) -> Vec<LaunchRequest> {
        self.lock()
            .launches
            .iter()
            .filter(|r| &r.key == key)
            .cloned()
            .collect()
    }

    pub(crate) fn launch_count(&self, key: &PluginKey) -> usize {
        self.launches(key).len()
    }

    /// Instances whose process has not exited.
    pub(crate) fn running(&self) -> usize {
        self.lock()
            .exits
            .iter()
            .filter(|e| e.try_get().is_none())
            .count()
    }

    /// Make the newest instance of `key` exit with code 1.
    pub(crate) fn crash(&self, key: &PluginKey) -> bool {
        self.lock()
            .crash_switches
            .remove(key)
            .is_some_and(|switch| switch.send(()).is_ok())
    }

    /// Fail every later launch of `key`.
    pub(crate) fn fail_launches(&self, key: &PluginKey) {
        self.lock().failing.insert(key.clone());
    }

    /// Dispense a client of `kind` for `key` regardless of the request.
    pub(crate) fn dispense_as(&self, key: &PluginKey, kind: PluginKind) {
        self.lock().dispense_as.insert(key.clone(), kind);
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, request: LaunchRequest) -> PluginResult<LaunchedPlugin> {
        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }

        let (sender, cleanup, exit) = lifecycle();
        let (crash_tx, crash_rx) = oneshot::channel();
        let (instance, kind) = {
            let mut state = self.lock();
            state.launches.push(request.clone());
            if state.failing.contains(&request.key) {
                return Err(PluginError::LaunchFailed {
                    key: request.key.to_string(),
                    message: "injected failure".to_owned(),
                });
            }
            state.next_instance = state.next_instance.saturating_add(1);
            state.crash_switches.insert(request.key.clone(), crash_tx);
            state.exits.push(exit.clone());
            let kind = state
                .dispense_as
                .get(&request.key)
                .copied()
                .unwrap_or(request.kind);
            (state.next_instance, kind)
        };

        tokio::spawn(async move {
            let kill = sender.kill_token();
            tokio::select! {
                () = kill.cancelled() => sender.report(Some(0)),
                Ok(()) = crash_rx => sender.report(Some(1)),
            }
        });

        let key = request.key;
        let client = match kind {
            PluginKind::Executor => {
                DispensedClient::Executor(Arc::new(FakeExecutor { key, instance }))
            },
            PluginKind::Source => DispensedClient::Source(Arc::new(FakeSource { key, instance })),
        };
        Ok(LaunchedPlugin {
            client,
            cleanup,
            exit,
        })
    }
}

fn fake_metadata(key: &PluginKey, instance: u64) -> Metadata {
    Metadata {
        description: format!("{key} instance {instance}"),
        version: "v0.0.0-fake".to_owned(),
        ..Metadata::default()
    }
}

struct FakeExecutor {
    key: PluginKey,
    instance: u64,
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn execute(&self, input: ExecuteInput) -> PluginResult<ExecuteOutput> {
        Ok(ExecuteOutput {
            data: format!("{}: {}", self.key, input.command),
        })
    }

    async fn metadata(&self) -> PluginResult<Metadata> {
        Ok(fake_metadata(&self.key, self.instance))
    }
}

struct FakeSource {
    key: PluginKey,
    instance: u64,
}

#[async_trait]
impl Source for FakeSource {
    async fn stream(&self, _input: StreamInput) -> PluginResult<mpsc::Receiver<SourceEvent>> {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(SourceEvent {
            payload: serde_json::json!({ "instance": self.instance }),
        });
        Ok(rx)
    }

    async fn metadata(&self) -> PluginResult<Metadata> {
        Ok(fake_metadata(&self.key, self.instance))
    }
}

/// A `file://` plugin repository in a temporary directory.
pub(crate) struct TestRepo {
    dir: TempDir,
    entries: Vec<IndexEntry>,
}

impl TestRepo {
    pub(crate) fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            entries: Vec::new(),
        }
    }

    /// Publish a binary for the running platform.
    pub(crate) fn publish(&mut self, kind: PluginKind, name: &str, version: &str) -> &mut Self {
        self.publish_for(kind, name, version, &Platform::current())
    }

    /// Publish a binary for `platform`.
    pub(crate) fn publish_for(
        &mut self,
        kind: PluginKind,
        name: &str,
        version: &str,
        platform: &Platform,
    ) -> &mut Self {
        let bin_dir = self.dir.path().join("bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        let file = bin_dir.join(format!(
            "{kind}_{name}_{version}_{}_{}",
            platform.os, platform.arch
        ));
        let content = format!("#!/bin/sh\n# {kind} {name} {version}\n");
        std::fs::write(&file, &content).unwrap();

        self.entries.push(IndexEntry {
            name: name.to_owned(),
            kind,
            description: format!("{name} test plugin"),
            version: version.to_owned(),
            json_schema: None,
            urls: vec![IndexUrl {
                url: file_url(&file),
                checksum: Some(format!("sha256:{}", hex::encode(Sha256::digest(content)))),
                platform: IndexPlatform {
                    os: platform.os.clone(),
                    architecture: platform.arch.clone(),
                },
                dependencies: Default::default(),
            }],
        });
        self
    }

    /// Path of the published index.
    pub(crate) fn index_path(&self) -> PathBuf {
        self.dir.path().join("index.yaml")
    }

    /// Write the index and return a config pointing at it, with nothing enabled.
    pub(crate) fn config(&self) -> Config {
        let index = Index {
            entries: self.entries.clone(),
        };
        std::fs::write(self.index_path(), index.to_yaml().unwrap()).unwrap();

        let mut config = Config::default();
        config.plugins.cache_dir = self.cache_dir();
        config
            .plugins
            .repositories
            .insert(REPO.to_owned(), RepositorySection::new(file_url(&self.index_path())));
        config
    }

    pub(crate) fn cache_dir(&self) -> PathBuf {
        self.dir.path().join("cache")
    }
}

/// Enable `raw_key` as a plugin of `kind` in the default binding group.
pub(crate) fn enable(config: &mut Config, kind: PluginKind, raw_key: &str) {
    let groups = match kind {
        PluginKind::Executor => &mut config.executors,
        PluginKind::Source => &mut config.sources,
    };
    groups
        .entry("default".to_owned())
        .or_default()
        .insert(raw_key.to_owned(), PluginBinding::enabled());
}

pub(crate) fn file_url(path: &Path) -> String {
    url::Url::from_file_path(path).unwrap().to_string()
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub(crate) async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}
