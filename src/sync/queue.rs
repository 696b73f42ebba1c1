use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// Bounded FIFO hand-off between threads.
///
/// With `drop_if_full` an append to a full queue discards the item instead
/// of blocking. [`BoundedQueue::no_more`] closes the queue: queued items are
/// still delivered, after which `remove` returns `None`.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    drop_if_full: bool,
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize, drop_if_full: bool) -> Self {
        let capacity = capacity.max(1);

        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            drop_if_full,
        }
    }

    /// Queue `item`; returns false if it was dropped.
    pub fn append(&self, item: T) -> bool {
        let mut state = self.state.lock();

        while !state.closed && state.items.len() >= self.capacity {
            if self.drop_if_full {
                return false;
            }
            self.not_full.wait(&mut state);
        }

        if state.closed {
            return false;
        }

        state.items.push_back(item);
        self.not_empty.notify_one();
        true
    }

    /// Block for the next item; `None` once closed and drained.
    pub fn remove(&self) -> Option<T> {
        let mut state = self.state.lock();

        loop {
            if let Some(item) = state.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    pub fn try_remove(&self) -> Option<T> {
        let item = self.state.lock().items.pop_front();

        if item.is_some() {
            self.not_full.notify_one();
        }

        item
    }

    /// Close the queue and wake every blocked producer and consumer.
    pub fn no_more(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
