use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Cooperative cancellation flag shared between a loop and its owner.
///
/// Waiting on the signal returns early once it fires, so a loop sleeping
/// between polls stops promptly.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let (flag, cvar) = &*self.inner;
        let mut stopped = match flag.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *stopped = true;
        cvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        match self.inner.0.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Sleep up to `timeout`; returns `true` if the signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut stopped = match flag.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            stopped = match cvar.wait_timeout(stopped, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_returns_early_on_stop() {
        let signal = StopSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(1)));

        let remote = signal.clone();
        let waiter = thread::spawn(move || {
            let started = Instant::now();
            let fired = remote.wait_timeout(Duration::from_secs(30));
            (fired, started.elapsed())
        });
        thread::sleep(Duration::from_millis(20));
        signal.stop();

        let (fired, waited) = waiter.join().expect("join");
        assert!(fired);
        assert!(waited < Duration::from_secs(10));
        assert!(signal.is_stopped());
    }
}
