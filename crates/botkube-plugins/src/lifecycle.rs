//! Process lifecycle handles: cleanup and exit notification.
//!
//! Every launched plugin instance comes with a [`Cleanup`] that terminates
//! it and a [`ProcessExit`] that resolves once the instance is gone. The
//! supervising side holds the matching [`ExitSender`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// How a plugin process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Whether the exit was requested through [`Cleanup`].
    pub requested: bool,
}

/// Terminates a plugin instance. Cloneable and idempotent.
#[derive(Debug, Clone)]
pub struct Cleanup {
    inner: Arc<CleanupInner>,
}

#[derive(Debug)]
struct CleanupInner {
    kill: CancellationToken,
    invoked: AtomicBool,
    exit: watch::Receiver<Option<ExitReport>>,
}

impl Cleanup {
    /// Request termination without waiting. Later calls are no-ops.
    pub fn trigger(&self) {
        if !self.inner.invoked.swap(true, Ordering::SeqCst) {
            self.inner.kill.cancel();
        }
    }

    /// Whether termination has been requested.
    #[must_use]
    pub fn is_invoked(&self) -> bool {
        self.inner.invoked.load(Ordering::SeqCst)
    }

    /// Wait until the process has exited.
    pub async fn wait(&self) -> ExitReport {
        wait_for_report(self.inner.exit.clone()).await
    }

    /// Request termination and wait for the exit.
    pub async fn run(&self) -> ExitReport {
        self.trigger();
        self.wait().await
    }
}

/// Resolves when the plugin process exits, for any reason.
#[derive(Debug, Clone)]
pub struct ProcessExit {
    rx: watch::Receiver<Option<ExitReport>>,
}

impl ProcessExit {
    /// Wait for the exit.
    pub async fn wait(self) -> ExitReport {
        wait_for_report(self.rx).await
    }

    /// The exit report, if the process already exited.
    #[must_use]
    pub fn try_get(&self) -> Option<ExitReport> {
        *self.rx.borrow()
    }
}

/// The supervising half: learns when a kill is requested and publishes the exit.
///
/// Dropping the sender without calling [`ExitSender::report`] publishes an
/// exit with no code.
#[derive(Debug)]
pub struct ExitSender {
    tx: watch::Sender<Option<ExitReport>>,
    kill: CancellationToken,
}

impl ExitSender {
    /// Token cancelled once cleanup has been requested.
    #[must_use]
    pub fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }

    /// Publish the exit. The report is marked requested if cleanup was
    /// triggered before the process ended.
    pub fn report(self, code: Option<i32>) {
        self.publish(code);
    }

    fn publish(&self, code: Option<i32>) {
        let requested = self.kill.is_cancelled();
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(ExitReport { code, requested });
            true
        });
    }
}

impl Drop for ExitSender {
    fn drop(&mut self) {
        self.publish(None);
    }
}

/// Create the three linked handles for one plugin instance.
#[must_use]
pub fn lifecycle() -> (ExitSender, Cleanup, ProcessExit) {
    let (tx, rx) = watch::channel(None);
    let kill = CancellationToken::new();

    let sender = ExitSender {
        tx,
        kill: kill.clone(),
    };
    let cleanup = Cleanup {
        inner: Arc::new(CleanupInner {
            kill,
            invoked: AtomicBool::new(false),
            exit: rx.clone(),
        }),
    };

    (sender, cleanup, ProcessExit { rx })
}

async fn wait_for_report(mut rx: watch::Receiver<Option<ExitReport>>) -> ExitReport {
    // The sender always publishes before it is dropped, so a closed channel
    // still holds the final report.
    if let Ok(report) = rx.wait_for(Option::is_some).await
        && let Some(report) = *report
    {
        return report;
    }
    rx.borrow().unwrap_or(ExitReport {
        code: None,
        requested: false,
    })
}
