//! Local speaking indicator
//!
//! Going active is immediate: the capture thread calls [`SpeakingDetector::observe`]
//! for every conditioned block. Going inactive waits for the debounce window
//! and is decided by a separate timer task, so a stalled capture thread
//! still clears the indicator.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::events::{EventBus, MediaEvent};

/// Period of the inactivity timer
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct SpeakingState {
    speaking: bool,
    last_active: Option<Instant>,
}

/// Debounced voice-activity flag shared between capture and timer
#[derive(Clone)]
pub struct SpeakingDetector {
    debounce: Duration,
    state: Arc<Mutex<SpeakingState>>,
    events: Option<Arc<EventBus>>,
}

impl SpeakingDetector {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            state: Arc::new(Mutex::new(SpeakingState::default())),
            events: None,
        }
    }

    pub fn with_events(debounce: Duration, events: Arc<EventBus>) -> Self {
        Self {
            events: Some(events),
            ..Self::new(debounce)
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.state.lock().speaking
    }

    /// Record the gate decision of one block
    pub fn observe(&self, voice_active: bool) {
        self.observe_at(voice_active, Instant::now());
    }

    pub(crate) fn observe_at(&self, voice_active: bool, now: Instant) {
        if !voice_active {
            return;
        }
        let changed = {
            let mut state = self.state.lock();
            state.last_active = Some(now);
            !std::mem::replace(&mut state.speaking, true)
        };
        if changed {
            self.notify(true);
        }
    }

    /// Clear the flag once the debounce window has passed without activity
    ///
    /// Returns true if the flag changed.
    pub fn poll(&self) -> bool {
        self.poll_at(Instant::now())
    }

    pub(crate) fn poll_at(&self, now: Instant) -> bool {
        let changed = {
            let mut state = self.state.lock();
            let expired = state
                .last_active
                .map(|t| now.saturating_duration_since(t) >= self.debounce)
                .unwrap_or(true);
            if state.speaking && expired {
                state.speaking = false;
                true
            } else {
                false
            }
        };
        if changed {
            self.notify(false);
        }
        changed
    }

    /// Clear the flag immediately (capture stopped)
    pub fn reset(&self) {
        let changed = {
            let mut state = self.state.lock();
            state.last_active = None;
            std::mem::replace(&mut state.speaking, false)
        };
        if changed {
            self.notify(false);
        }
    }

    /// Start the inactivity timer
    pub fn spawn_timer(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let detector = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        detector.poll();
                    }
                }
            }
        })
    }

    fn notify(&self, speaking: bool) {
        debug!(speaking, "Speaking state changed");
        if let Some(events) = &self.events {
            events.publish(MediaEvent::SpeakingChanged { speaking });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_is_immediate() {
        let detector = SpeakingDetector::new(Duration::from_millis(200));
        assert!(!detector.is_speaking());
        detector.observe_at(false, Instant::now());
        assert!(!detector.is_speaking());
        detector.observe_at(true, Instant::now());
        assert!(detector.is_speaking());
    }

    #[test]
    fn test_deactivation_waits_for_debounce() {
        let detector = SpeakingDetector::new(Duration::from_millis(200));
        let start = Instant::now();
        detector.observe_at(true, start);

        assert!(!detector.poll_at(start + Duration::from_millis(100)));
        assert!(detector.is_speaking());

        // Activity inside the window restarts it
        detector.observe_at(true, start + Duration::from_millis(150));
        assert!(!detector.poll_at(start + Duration::from_millis(300)));

        assert!(detector.poll_at(start + Duration::from_millis(350)));
        assert!(!detector.is_speaking());
        assert!(!detector.poll_at(start + Duration::from_millis(400)));
    }

    #[test]
    fn test_reset_clears_immediately() {
        let detector = SpeakingDetector::new(Duration::from_secs(10));
        detector.observe(true);
        detector.reset();
        assert!(!detector.is_speaking());
        assert!(!detector.poll());
    }

    #[tokio::test]
    async fn test_events_published_once_per_flip() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let detector = SpeakingDetector::with_events(Duration::from_millis(10), bus);
        let start = Instant::now();

        detector.observe_at(true, start);
        detector.observe_at(true, start + Duration::from_millis(5));
        detector.poll_at(start + Duration::from_millis(20));
        detector.poll_at(start + Duration::from_millis(30));

        assert_eq!(
            rx.recv().await.unwrap(),
            MediaEvent::SpeakingChanged { speaking: true }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            MediaEvent::SpeakingChanged { speaking: false }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_timer_clears_flag() {
        let detector = SpeakingDetector::new(Duration::from_millis(20));
        let cancel = CancellationToken::new();
        let handle = detector.spawn_timer(cancel.clone());

        detector.observe(true);
        assert!(detector.is_speaking());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!detector.is_speaking());

        cancel.cancel();
        handle.await.unwrap();
    }
}
