use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Shutdown latch for periodic background loops.
///
/// Loops sleep with [`StopFlag::wait_timeout`] instead of a plain sleep so
/// that [`StopFlag::set`] ends them without waiting out the interval.
#[derive(Debug, Default)]
pub struct StopFlag {
    stopped: Mutex<bool>,
    changed: Condvar,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        *self.stopped.lock()
    }

    pub fn set(&self) {
        *self.stopped.lock() = true;
        self.changed.notify_all();
    }

    /// Sleep for up to `timeout`; returns true if the flag is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();

        if !*stopped {
            self.changed.wait_for(&mut stopped, timeout);
        }

        *stopped
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use super::*;

    #[test]
    fn test_wait_timeout_expires() {
        let flag = StopFlag::new();
        assert!(!flag.wait_timeout(Duration::from_millis(10)));
        assert!(!flag.is_set());
    }

    #[test]
    fn test_set_wakes_sleeper() {
        let flag = Arc::new(StopFlag::new());
        let sleeper = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                let started = Instant::now();
                let stopped = flag.wait_timeout(Duration::from_secs(30));
                (stopped, started.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(20));
        flag.set();

        let (stopped, elapsed) = sleeper.join().expect("sleeper thread");
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(10));
    }
}
