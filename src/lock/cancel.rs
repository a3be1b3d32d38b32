use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::{Condvar, Mutex};

/// Cooperative cancellation shared between a caller and a polling task.
///
/// The task checks it once per poll tick; `sleep` doubles as the tick so a
/// cancel wakes the task without waiting out the interval.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    condvar: Condvar,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        *cancelled = true;
        self.inner.condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Sleep for `timeout` or until cancelled. Returns whether the token is cancelled.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self.inner.cancelled.lock();
        while !*cancelled {
            if self.inner.condvar.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn sleep_runs_to_timeout_when_not_cancelled() {
        let token = CancellationToken::new();
        let start = Instant::now();
        assert!(!token.sleep(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn cancel_wakes_a_sleeper() {
        let token = CancellationToken::new();
        let sleeper = token.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let cancelled = sleeper.sleep(Duration::from_secs(30));
            (cancelled, start.elapsed())
        });

        thread::sleep(Duration::from_millis(20));
        token.cancel();
        let (cancelled, elapsed) = handle.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(5));
    }
}
