//! Cancellable timers, one thread per timer.
//!
//! A timer thread sleeps until its deadline, re-checks its cancellation
//! flag, and then runs the callback. Cancellation is idempotent, may
//! happen at any time, and does not wait for an in-flight callback;
//! cancelling after the callback fired is a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::trace;

/// A time source, swappable for tests.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// The wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Handle to a scheduled timer.
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TimerHandle {
    /// Cancels the timer. Idempotent; does not wait for an in-flight
    /// callback.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Waits for the timer thread to exit (tests and shutdown).
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        // Dropping a handle abandons, but never blocks on, the thread
        self.cancel();
        if let Some(thread) = self.thread.take() {
            drop(thread);
        }
    }
}

/// Spawns scheduled callbacks on dedicated threads.
pub struct TimerService {
    clock: Arc<dyn Clock>,
}

impl TimerService {
    /// Creates a service using the given time source.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Schedules `callback` to run at or after `deadline_ms` unless
    /// cancelled first.
    pub fn schedule<F>(&self, deadline_ms: u64, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let clock = Arc::clone(&self.clock);
        let thread = thread::spawn(move || {
            loop {
                if flag.load(Ordering::Acquire) {
                    return;
                }
                let now = clock.now_ms();
                if now >= deadline_ms {
                    break;
                }
                // Sleep in slices so cancellation stays responsive
                let remaining = deadline_ms - now;
                thread::sleep(Duration::from_millis(remaining.min(50)));
            }
            if flag.load(Ordering::Acquire) {
                trace!("Timer cancelled before firing");
                return;
            }
            callback();
        });
        TimerHandle {
            cancelled,
            thread: Some(thread),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fires_at_or_after_deadline() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let service = TimerService::new(Arc::clone(&clock));
        let fired = Arc::new(AtomicUsize::new(0));
        let observer = Arc::clone(&fired);
        let deadline = clock.now_ms() + 30;
        let handle = service.schedule(deadline, move || {
            observer.fetch_add(1, Ordering::SeqCst);
        });
        handle.join();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(SystemClock.now_ms() >= deadline);
    }

    #[test]
    fn cancellation_prevents_firing() {
        let service = TimerService::new(Arc::new(SystemClock));
        let fired = Arc::new(AtomicUsize::new(0));
        let observer = Arc::clone(&fired);
        let handle = service.schedule(SystemClock.now_ms() + 200, move || {
            observer.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();
        handle.join();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_after_fire_is_noop() {
        let service = TimerService::new(Arc::new(SystemClock));
        let handle = service.schedule(0, || {});
        std::thread::sleep(Duration::from_millis(30));
        handle.cancel();
        handle.join();
    }
}
