//! Single-slot debouncer
//!
//! Holds at most one pending value and one timer. Every `schedule` replaces
//! the pending value and restarts the timer, so a burst of updates produces
//! a single trailing action carrying the latest value.

use std::time::Duration;

use tokio::task::JoinHandle;

pub struct Debouncer<T> {
    window: Duration,
    pending: Option<T>,
    timer: Option<JoinHandle<()>>,
    token: u64,
}

impl<T> Debouncer<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
            timer: None,
            token: 0,
        }
    }

    /// Replace the pending value and restart the timer
    ///
    /// When the window elapses without another `schedule`, `fire` is called
    /// with the token the owner must pass back to [`Self::take_if_current`].
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&mut self, value: T, fire: F)
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.abort_timer();
        self.token = self.token.wrapping_add(1);
        self.pending = Some(value);

        let token = self.token;
        let window = self.window;
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            fire(token);
        }));
    }

    pub fn pending(&self) -> Option<&T> {
        self.pending.as_ref()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Take the pending value if `token` belongs to the latest schedule
    ///
    /// A timer that fired just before being replaced carries a stale token
    /// and gets nothing.
    pub fn take_if_current(&mut self, token: u64) -> Option<T> {
        if token != self.token {
            return None;
        }
        self.timer = None;
        self.pending.take()
    }

    /// Stop the timer and hand back the pending value, if any
    pub fn flush(&mut self) -> Option<T> {
        self.abort_timer();
        self.pending.take()
    }

    /// Stop the timer and drop the pending value
    ///
    /// Returns whether a value was dropped.
    pub fn cancel(&mut self) -> bool {
        self.abort_timer();
        self.pending.take().is_some()
    }

    fn abort_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl<T> Drop for Debouncer<T> {
    fn drop(&mut self) {
        self.abort_timer();
    }
}
