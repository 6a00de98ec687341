//! Starting plugin processes.
//!
//! [`Launcher`] is the seam between the runtime and the operating system:
//! [`ProcessLauncher`] spawns real subprocesses, tests plug in fakes.

pub mod env_policy;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use botkube_config::PluginsSection;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

use crate::client::DispensedClient;
use crate::error::{PluginError, PluginResult};
use crate::key::{PluginKey, PluginKind};
use crate::lifecycle::{Cleanup, ExitSender, ProcessExit, lifecycle};
use crate::protocol::{
    APP_PROTOCOL_VERSION, Handshake, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, PROTOCOL_VERSION_KEY,
};
use crate::rpc::{RpcConnection, RpcExecutor, RpcSource};

/// Longest handshake line accepted from a plugin.
const MAX_HANDSHAKE_LINE: usize = 1024;

/// What to start.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Plugin key, for logs and errors.
    pub key: PluginKey,
    /// Kind the configuration expects.
    pub kind: PluginKind,
    /// Path of the cached binary.
    pub binary: PathBuf,
    /// Extra environment for the process.
    pub env: Vec<(String, String)>,
}

/// A started plugin instance.
#[derive(Debug)]
pub struct LaunchedPlugin {
    /// The dispensed client.
    pub client: DispensedClient,
    /// Terminates the instance.
    pub cleanup: Cleanup,
    /// Resolves when the instance exits.
    pub exit: ProcessExit,
}

/// Starts plugin instances.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start the binary, complete the handshake and dispense a client.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started, the handshake
    /// fails, or the plugin dispenses the wrong kind of client.
    async fn launch(&self, request: LaunchRequest) -> PluginResult<LaunchedPlugin>;
}

/// Launches plugins as supervised subprocesses speaking JSON lines over stdio.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    handshake_timeout: Duration,
    forward_env: Vec<String>,
}

impl ProcessLauncher {
    /// Launcher with the given handshake timeout and no forwarded variables.
    #[must_use]
    pub fn new(handshake_timeout: Duration) -> Self {
        Self {
            handshake_timeout,
            forward_env: Vec::new(),
        }
    }

    /// Launcher configured from the `[plugins]` section.
    #[must_use]
    pub fn from_config(config: &PluginsSection) -> Self {
        Self::new(config.handshake_timeout()).with_forward_env(config.forward_env.clone())
    }

    /// Variables copied from the agent environment when present.
    #[must_use]
    pub fn with_forward_env(mut self, names: Vec<String>) -> Self {
        self.forward_env = names;
        self
    }

    fn command(&self, request: &LaunchRequest) -> Command {
        let mut cmd = Command::new(&request.binary);

        for (key, _) in std::env::vars_os() {
            if let Some(key) = key.to_str()
                && env_policy::is_blocked_plugin_env(key)
            {
                cmd.env_remove(key);
            }
        }
        for name in &self.forward_env {
            if let Some(value) = std::env::var_os(name) {
                cmd.env(name, value);
            }
        }
        for (key, value) in &request.env {
            if env_policy::is_blocked_plugin_env(key) {
                warn!(plugin = %request.key, var = %key, "refusing to set blocked environment variable");
                continue;
            }
            cmd.env(key, value);
        }

        cmd.env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .env(PROTOCOL_VERSION_KEY, APP_PROTOCOL_VERSION.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, request: LaunchRequest) -> PluginResult<LaunchedPlugin> {
        let key = request.key.to_string();
        let launch_failed = |message: String| PluginError::LaunchFailed {
            key: key.clone(),
            message,
        };

        debug!(plugin = %key, binary = %request.binary.display(), "starting plugin process");
        let mut child = self
            .command(&request)
            .spawn()
            .map_err(|e| launch_failed(format!("spawn {}: {e}", request.binary.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| launch_failed("stdin not captured".to_owned()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_failed("stdout not captured".to_owned()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, key.clone()));
        }

        // `child` is dropped (and killed) on any early return below.
        let mut stdout = BufReader::new(stdout);
        let handshake = read_handshake(&mut stdout, self.handshake_timeout, &key).await?;

        let dispensed_kind = PluginKind::from_name(&handshake.kind);
        if dispensed_kind != Some(request.kind) {
            return Err(PluginError::UnexpectedClient {
                key,
                expected: request.kind,
                actual: handshake.kind,
            });
        }

        let conn = RpcConnection::new(stdout, stdin, key.clone());
        let client = match request.kind {
            PluginKind::Executor => DispensedClient::Executor(Arc::new(RpcExecutor::new(conn))),
            PluginKind::Source => DispensedClient::Source(Arc::new(RpcSource::new(conn))),
        };

        let (sender, cleanup, exit) = lifecycle();
        info!(plugin = %key, pid = ?child.id(), kind = %request.kind, "plugin process started");
        tokio::spawn(supervise(child, sender, key));

        Ok(LaunchedPlugin {
            client,
            cleanup,
            exit,
        })
    }
}

async fn read_handshake(
    stdout: &mut BufReader<tokio::process::ChildStdout>,
    timeout: Duration,
    key: &str,
) -> PluginResult<Handshake> {
    let handshake_error = |message: String| PluginError::Handshake {
        key: key.to_owned(),
        message,
    };

    let mut line = String::new();
    let read = tokio::time::timeout(timeout, stdout.read_line(&mut line))
        .await
        .map_err(|_| handshake_error(format!("timed out after {}s", timeout.as_secs())))?
        .map_err(|e| handshake_error(format!("reading stdout: {e}")))?;

    if read == 0 {
        return Err(handshake_error(
            "plugin exited before completing the handshake".to_owned(),
        ));
    }
    if line.len() > MAX_HANDSHAKE_LINE {
        return Err(handshake_error(format!(
            "handshake line exceeds {MAX_HANDSHAKE_LINE} bytes"
        )));
    }

    let handshake = Handshake::parse(&line).map_err(handshake_error)?;
    handshake.validate().map_err(handshake_error)?;
    Ok(handshake)
}

/// Wait for the child to exit, killing it once cleanup is requested.
async fn supervise(mut child: Child, sender: ExitSender, key: String) {
    let kill = sender.kill_token();
    let status = tokio::select! {
        status = child.wait() => status,
        () = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                debug!(plugin = %key, error = %e, "kill failed, process may already be gone");
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(plugin = %key, error = %e, "failed to reap plugin process");
            None
        },
    };
    debug!(plugin = %key, code = ?code, "plugin process exited");
    sender.report(code);
}

async fn forward_stderr(stderr: ChildStderr, key: String) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(plugin = %key, "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(plugin = %key, error = %e, "plugin stderr closed");
                break;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_forwards_kubeconfig() {
        let launcher = ProcessLauncher::from_config(&PluginsSection::default());
        assert_eq!(launcher.forward_env, vec!["KUBECONFIG".to_owned()]);
        assert_eq!(launcher.handshake_timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn missing_binary_is_a_launch_failure() {
        let launcher = ProcessLauncher::new(Duration::from_secs(1));
        let err = launcher
            .launch(LaunchRequest {
                key: PluginKey::new("botkube", "ghost"),
                kind: PluginKind::Executor,
                binary: PathBuf::from("/nonexistent/botkube/executor_v0.0.0_ghost"),
                env: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::LaunchFailed { .. }), "{err}");
        assert!(err.to_string().contains("botkube/ghost"));
    }
}
