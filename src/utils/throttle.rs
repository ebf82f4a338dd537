//! Log throttling
//!
//! A collaborator streaming measurement updates into a closed link would
//! otherwise produce one warning per frame.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Limits how often a message keyed by `key` is logged
pub struct LogThrottler {
    last_logged: Mutex<HashMap<&'static str, Instant>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` (and records the time) if `key` was not logged within
    /// the interval
    pub fn should_log(&self, key: &'static str) -> bool {
        let now = Instant::now();
        let mut map = self.last_logged.lock();
        match map.get(key) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                map.insert(key, now);
                true
            }
        }
    }

    /// Forget `key`, so the next occurrence is logged immediately
    ///
    /// Called when the condition recovers (e.g. the link reopens).
    pub fn clear(&self, key: &'static str) {
        self.last_logged.lock().remove(key);
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `tracing::warn!`
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_throttling() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert!(throttler.should_log("closed_link"));
        assert!(!throttler.should_log("closed_link"));

        thread::sleep(Duration::from_millis(150));
        assert!(throttler.should_log("closed_link"));
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("a"));
        assert!(throttler.should_log("b"));
        assert!(!throttler.should_log("a"));
    }

    #[test]
    fn test_clear() {
        let throttler = LogThrottler::default();

        assert!(throttler.should_log("closed_link"));
        throttler.clear("closed_link");
        assert!(throttler.should_log("closed_link"));
    }
}
