//! Capture helper process lifetime
//!
//! A [`CaptureSession`] owns one helper child process and the blocking
//! reader tasks pumping its stdout and stderr. The helper runs in its own
//! process group so termination reaches anything it forked.
//!
//! Shutdown is cooperative and bounded: the reader cancellation token is
//! raised, the readers get a brief head start, then the group gets SIGTERM
//! and `shutdown_grace` to exit before SIGKILL. Either way the session
//! reports "stopped" exactly once, after the child has been reaped.
//!
//! A helper that exits while a forked descendant still holds its pipes is
//! reported as stopped too: the readers get a short drain window, after
//! which the rest of the group is killed and blocked readers are left to
//! finish on their own.

use std::fmt;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};

/// Interval for polling the child for exit
const REAP_POLL: Duration = Duration::from_millis(20);

/// Time readers get to flush output after the child exits
const READER_DRAIN: Duration = Duration::from_millis(250);

/// Time readers get to see cancellation before the group is signalled
const STOP_READER_GRACE: Duration = Duration::from_millis(50);

/// Local capture source type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Microphone,
    Camera,
    Screen,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Microphone => "microphone",
            SourceKind::Camera => "camera",
            SourceKind::Screen => "screen",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capture source lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    Idle,
    Starting,
    Running,
    Stopped,
    /// Could not start (missing helper, device error)
    Unavailable,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CaptureState::Idle => "idle",
            CaptureState::Starting => "starting",
            CaptureState::Running => "running",
            CaptureState::Stopped => "stopped",
            CaptureState::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionExit {
    /// `stop()` was called before the helper exited
    pub requested: bool,
    /// Exit status, if the child could be reaped
    pub status: Option<ExitStatus>,
}

impl SessionExit {
    /// Description for a helper that exited on its own
    pub fn describe(&self) -> String {
        match self.status {
            Some(status) => format!("helper exited: {}", status),
            None => "helper exited".to_string(),
        }
    }
}

type StopCallback = Box<dyn Fn(SessionExit) + Send + Sync>;

struct SessionInner {
    kind: SourceKind,
    pid: u32,
    child: Mutex<Option<Child>>,
    cancel: CancellationToken,
    requested: AtomicBool,
    stopped: AtomicBool,
    exited_tx: watch::Sender<bool>,
    on_stopped: StopCallback,
}

impl SessionInner {
    fn signal(&self, signal: Signal) {
        // Negative-pid semantics: the helper leads its own group
        match killpg(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) => debug!("Sent {} to {} helper group {}", signal, self.kind, self.pid),
            Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => warn!("Failed to send {} to {} helper: {}", signal, self.kind, e),
        }
    }

    fn force_kill(&self) {
        self.signal(Signal::SIGKILL);
        if let Some(child) = self.child.lock().as_mut() {
            let _ = child.kill();
        }
    }

    fn try_reap(&self) -> Option<Option<ExitStatus>> {
        let mut guard = self.child.lock();
        let child = match guard.as_mut() {
            Some(child) => child,
            None => return Some(None),
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                guard.take();
                Some(Some(status))
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to reap {} helper: {}", self.kind, e);
                guard.take();
                Some(None)
            }
        }
    }

    fn finish(&self, status: Option<ExitStatus>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let exit = SessionExit {
            requested: self.requested.load(Ordering::SeqCst),
            status,
        };
        if exit.requested {
            info!("{} helper stopped", self.kind);
        } else {
            warn!("{} helper stopped unexpectedly ({})", self.kind, exit.describe());
        }
        (self.on_stopped)(exit);
        let _ = self.exited_tx.send(true);
    }
}

/// Running helper process with its reader tasks
pub struct CaptureSession {
    inner: Arc<SessionInner>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    exited_rx: watch::Receiver<bool>,
    grace: Duration,
}

impl CaptureSession {
    /// Start `command` and pump its output through the given readers
    ///
    /// Both readers run on the blocking pool and must return once their pipe
    /// reaches EOF; they may also poll the token to bail out early.
    /// `on_stopped` runs exactly once when the session ends for any reason.
    pub fn spawn<O, E, S>(
        kind: SourceKind,
        mut command: Command,
        grace: Duration,
        on_stdout: O,
        on_stderr: E,
        on_stopped: S,
    ) -> Result<Self>
    where
        O: FnOnce(ChildStdout, CancellationToken) + Send + 'static,
        E: FnOnce(ChildStderr, CancellationToken) + Send + 'static,
        S: Fn(SessionExit) + Send + Sync + 'static,
    {
        let program = command.get_program().to_string_lossy().into_owned();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = command.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                AppError::capture_unavailable(kind, format!("executable not found: {}", program))
            }
            _ => AppError::capture_unavailable(kind, format!("failed to start {}: {}", program, e)),
        })?;

        let pid = child.id();
        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(AppError::capture_unavailable(kind, "helper pipes unavailable"));
            }
        };

        info!("Started {} helper {} (pid {})", kind, program, pid);

        let cancel = CancellationToken::new();
        let (exited_tx, exited_rx) = watch::channel(false);
        let inner = Arc::new(SessionInner {
            kind,
            pid,
            child: Mutex::new(Some(child)),
            cancel: cancel.clone(),
            requested: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            exited_tx,
            on_stopped: Box::new(on_stopped),
        });

        let stdout_cancel = cancel.clone();
        let stdout_task = tokio::task::spawn_blocking(move || on_stdout(stdout, stdout_cancel));
        let stderr_task = tokio::task::spawn_blocking(move || on_stderr(stderr, cancel));

        let monitor_inner = inner.clone();
        let monitor = tokio::spawn(async move {
            let inner = monitor_inner;
            let mut readers = Box::pin(async move {
                let _ = stdout_task.await;
                let _ = stderr_task.await;
            });

            // Whichever comes first: both pipes closed, or the child exited
            let exited = loop {
                tokio::select! {
                    _ = &mut readers => break None,
                    _ = tokio::time::sleep(REAP_POLL) => {
                        if let Some(status) = inner.try_reap() {
                            break Some(status);
                        }
                    }
                }
            };

            let status = match exited {
                Some(status) => {
                    if tokio::time::timeout(READER_DRAIN, &mut readers).await.is_err() {
                        warn!(
                            "{} helper exited but its pipes are still open, killing its process group",
                            inner.kind
                        );
                        inner.cancel.cancel();
                        inner.signal(Signal::SIGKILL);
                        if tokio::time::timeout(READER_DRAIN, &mut readers).await.is_err() {
                            warn!("{} helper readers still blocked, detaching them", inner.kind);
                        }
                    }
                    status
                }
                None => {
                    debug!("{} helper readers finished", inner.kind);
                    // Pipes are closed; the child is exiting or has been told to
                    loop {
                        if let Some(status) = inner.try_reap() {
                            break status;
                        }
                        tokio::time::sleep(REAP_POLL).await;
                    }
                }
            };
            inner.finish(status);
        });

        Ok(Self {
            inner,
            monitor: Mutex::new(Some(monitor)),
            exited_rx,
            grace,
        })
    }

    pub fn kind(&self) -> SourceKind {
        self.inner.kind
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Wait until the session has ended on its own or been stopped
    pub async fn wait(&self) {
        let mut rx = self.exited_rx.clone();
        let _ = rx.wait_for(|exited| *exited).await;
    }

    /// Stop the helper: SIGTERM, grace period, then SIGKILL
    pub async fn stop(&self) {
        let monitor = self.monitor.lock().take();
        let Some(mut monitor) = monitor else {
            return;
        };

        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.cancel.cancel();
        if tokio::time::timeout(STOP_READER_GRACE, &mut monitor).await.is_ok() {
            return;
        }
        if !self.is_stopped() {
            self.inner.signal(Signal::SIGTERM);
        }

        if tokio::time::timeout(self.grace, &mut monitor).await.is_err() {
            warn!(
                "{} helper did not exit within {:?}, killing",
                self.inner.kind, self.grace
            );
            self.inner.force_kill();
            let _ = monitor.await;
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if self.monitor.lock().is_some() && !self.is_stopped() {
            self.inner.requested.store(true, Ordering::SeqCst);
            self.inner.cancel.cancel();
            self.inner.force_kill();
        }
    }
}
