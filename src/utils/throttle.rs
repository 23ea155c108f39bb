//! Log throttling for per-packet failures
//!
//! Send and decode errors can repeat on every packet (50 per second for
//! audio). The throttler lets the first occurrence through, then at most one
//! line per interval per key, reporting how many were suppressed meanwhile.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct KeyState {
    last_logged: Instant,
    suppressed: u64,
}

/// Rate limiter keyed by message kind
///
/// # Example
///
/// ```rust
/// use confab_media::utils::LogThrottler;
/// use std::time::Duration;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert!(throttler.should_log("write_rtp").is_some());
/// assert!(throttler.should_log("write_rtp").is_none());
/// ```
pub struct LogThrottler {
    keys: Mutex<HashMap<String, KeyState>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// `Some(suppressed)` when this occurrence should be logged, where
    /// `suppressed` counts occurrences swallowed since the last logged one.
    pub fn should_log(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut keys = self.keys.lock();
        match keys.get_mut(key) {
            Some(state) if now.duration_since(state.last_logged) < self.interval => {
                state.suppressed += 1;
                None
            }
            Some(state) => {
                let suppressed = std::mem::take(&mut state.suppressed);
                state.last_logged = now;
                Some(suppressed)
            }
            None => {
                keys.insert(
                    key.to_string(),
                    KeyState {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Forget a key once its error condition has recovered
    pub fn clear(&self, key: &str) {
        self.keys.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

impl Default for LogThrottler {
    /// 5 second interval
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled warning
///
/// ```rust
/// use confab_media::utils::LogThrottler;
/// use confab_media::warn_throttled;
///
/// let throttler = LogThrottler::default();
/// warn_throttled!(throttler, "decode", "Opus decode failed: {}", "corrupt");
/// ```
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.should_log($key) {
            tracing::warn!(suppressed, $($arg)*);
        }
    };
}

/// Throttled debug line
#[macro_export]
macro_rules! debug_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.should_log($key) {
            tracing::debug!(suppressed, $($arg)*);
        }
    };
}
