//! Lifecycle shared by the helper-backed capture sources

use std::process::{ChildStderr, ChildStdout, Command};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::args::HelperArgs;
use super::session::{CaptureSession, CaptureState, SourceKind};
use crate::config::CaptureConfig;
use crate::error::{AppError, Result};
use crate::events::{EventBus, MediaEvent};

/// Current state of a source, published on change
pub struct SourceStatus {
    kind: SourceKind,
    state: Mutex<CaptureState>,
    events: Option<Arc<EventBus>>,
}

impl SourceStatus {
    pub fn new(kind: SourceKind, events: Option<Arc<EventBus>>) -> Self {
        Self {
            kind,
            state: Mutex::new(CaptureState::Idle),
            events,
        }
    }

    pub fn get(&self) -> CaptureState {
        *self.state.lock()
    }

    pub fn set(&self, state: CaptureState, reason: Option<String>) {
        {
            let mut current = self.state.lock();
            if *current == state {
                return;
            }
            *current = state;
        }
        self.publish(state, reason);
    }

    /// Move to `state` only from `expected`; returns whether it moved
    pub fn advance(&self, expected: CaptureState, state: CaptureState) -> bool {
        {
            let mut current = self.state.lock();
            if *current != expected {
                return false;
            }
            *current = state;
        }
        self.publish(state, None);
        true
    }

    fn publish(&self, state: CaptureState, reason: Option<String>) {
        debug!("{} source -> {}", self.kind, state);
        if let Some(events) = &self.events {
            events.publish(MediaEvent::CaptureStateChanged {
                kind: self.kind,
                state,
                reason,
            });
        }
    }
}

/// One helper-backed source: at most one session at a time
pub struct HelperSource {
    kind: SourceKind,
    helper_path: String,
    grace: Duration,
    status: Arc<SourceStatus>,
    session: tokio::sync::Mutex<Option<CaptureSession>>,
}

impl HelperSource {
    pub fn new(kind: SourceKind, config: &CaptureConfig, events: Option<Arc<EventBus>>) -> Self {
        Self {
            kind,
            helper_path: config.helper_path.clone(),
            grace: Duration::from_millis(config.shutdown_grace_ms),
            status: Arc::new(SourceStatus::new(kind, events)),
            session: tokio::sync::Mutex::new(None),
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn state(&self) -> CaptureState {
        self.status.get()
    }

    pub fn status(&self) -> &Arc<SourceStatus> {
        &self.status
    }

    /// Launch the helper with `args`, pumping its pipes through the readers
    pub async fn start<O, E>(&self, args: &HelperArgs, on_stdout: O, on_stderr: E) -> Result<()>
    where
        O: FnOnce(ChildStdout, CancellationToken) + Send + 'static,
        E: FnOnce(ChildStderr, CancellationToken) + Send + 'static,
    {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            if !session.is_stopped() {
                return Err(AppError::InvalidState(format!(
                    "{} capture already running",
                    self.kind
                )));
            }
        }
        if let Some(old) = guard.take() {
            old.stop().await;
        }

        if let Err(e) = args.validate() {
            self.status.set(CaptureState::Unavailable, Some(e.to_string()));
            return Err(e);
        }

        self.status.set(CaptureState::Starting, None);
        let mut command = Command::new(&self.helper_path);
        command.args(args.to_args());

        let status = self.status.clone();
        let spawned = CaptureSession::spawn(
            self.kind,
            command,
            self.grace,
            on_stdout,
            on_stderr,
            move |exit| {
                let reason = (!exit.requested).then(|| exit.describe());
                status.set(CaptureState::Stopped, reason);
            },
        );

        let session = match spawned {
            Ok(session) => session,
            Err(e) => {
                self.status.set(CaptureState::Unavailable, Some(e.to_string()));
                return Err(e);
            }
        };

        // A helper that already exited leaves the state at Stopped
        self.status.advance(CaptureState::Starting, CaptureState::Running);
        info!("{} capture started ({})", self.kind, args.target);
        *guard = Some(session);
        Ok(())
    }

    pub async fn stop(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.stop().await;
        }
    }

    /// Wait for the current session to end, if there is one
    pub async fn wait(&self) {
        let guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            session.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::args::CaptureTarget;
    use crate::config::MicrophoneConfig;

    #[test]
    fn test_status_publishes_changes_only() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let status = SourceStatus::new(SourceKind::Camera, Some(bus));

        status.set(CaptureState::Starting, None);
        status.set(CaptureState::Starting, None);
        assert!(status.advance(CaptureState::Starting, CaptureState::Running));
        assert!(!status.advance(CaptureState::Starting, CaptureState::Running));

        let first = rx.try_recv().unwrap();
        assert_eq!(
            first,
            MediaEvent::CaptureStateChanged {
                kind: SourceKind::Camera,
                state: CaptureState::Starting,
                reason: None
            }
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            MediaEvent::CaptureStateChanged { state: CaptureState::Running, .. }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_helper_is_unavailable() {
        let config = CaptureConfig {
            helper_path: "/nonexistent/confab-capture".to_string(),
            ..Default::default()
        };
        let source = HelperSource::new(SourceKind::Microphone, &config, None);
        let args = HelperArgs::microphone("0", &MicrophoneConfig::default());
        let err = source.start(&args, |_, _| {}, |_, _| {}).await.unwrap_err();
        assert!(matches!(err, AppError::CaptureUnavailable { .. }));
        assert_eq!(source.state(), CaptureState::Unavailable);
    }

    #[tokio::test]
    async fn test_invalid_args_rejected_before_spawn() {
        let source = HelperSource::new(SourceKind::Screen, &CaptureConfig::default(), None);
        let mut config = crate::config::ScreenSourceConfig::default();
        config.fps = 0;
        let args = HelperArgs::screen(CaptureTarget::Display("0".into()), &config).unwrap();
        assert!(matches!(
            source.start(&args, |_, _| {}, |_, _| {}).await,
            Err(AppError::Config(_))
        ));
    }
}
