use parking_lot::{Condvar, Mutex};

/// A monotonically non-decreasing value that threads can wait on.
///
/// `advance_to` only ever raises the value; `wait_for` parks until the
/// value reaches a target. Every waiter whose target has been crossed is
/// released by the advance that crossed it.
#[derive(Debug)]
pub struct Watermark<T> {
    value: Mutex<T>,
    advanced: Condvar,
}

impl<T: Copy + Ord> Watermark<T> {
    pub fn new(initial: T) -> Self {
        Self {
            value: Mutex::new(initial),
            advanced: Condvar::new(),
        }
    }

    pub fn value(&self) -> T {
        *self.value.lock()
    }

    /// Raise the value to `target` if it is strictly greater.
    pub fn advance_to(&self, target: T) {
        let mut value = self.value.lock();

        if target > *value {
            *value = target;
            self.advanced.notify_all();
        }
    }

    /// Block until the value is at least `target`.
    pub fn wait_for(&self, target: T) {
        let mut value = self.value.lock();

        while *value < target {
            self.advanced.wait(&mut value);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_advance_is_monotonic() {
        let wm = Watermark::new(10i64);
        wm.advance_to(5);
        assert_eq!(wm.value(), 10);

        wm.advance_to(12);
        assert_eq!(wm.value(), 12);

        wm.advance_to(12);
        assert_eq!(wm.value(), 12);
    }

    #[test]
    fn test_wait_for_satisfied_returns_immediately() {
        let wm = Watermark::new(3i64);
        wm.wait_for(3);
        wm.wait_for(-7);
    }

    #[test]
    fn test_waiters_released_independently() {
        let wm = Arc::new(Watermark::new(0i64));
        let (tx, rx) = mpsc::channel();

        let handles: Vec<_> = [10i64, 20, 30]
            .into_iter()
            .map(|target| {
                let wm = Arc::clone(&wm);
                let tx = tx.clone();
                thread::spawn(move || {
                    wm.wait_for(target);
                    tx.send(target).expect("send release");
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(30));
        assert!(rx.try_recv().is_err());

        wm.advance_to(15);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(10));
        thread::sleep(Duration::from_millis(30));
        assert!(rx.try_recv().is_err());

        wm.advance_to(9);
        thread::sleep(Duration::from_millis(30));
        assert!(rx.try_recv().is_err());

        wm.advance_to(30);
        let mut rest = vec![
            rx.recv_timeout(Duration::from_secs(5)).expect("second waiter"),
            rx.recv_timeout(Duration::from_secs(5)).expect("third waiter"),
        ];
        rest.sort_unstable();
        assert_eq!(rest, vec![20, 30]);

        for h in handles {
            h.join().expect("waiter thread");
        }
    }
}
