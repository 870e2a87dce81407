// ===============================
// src/queue.rs
// ===============================
//
// Unbounded FIFO shared between pipeline stages (Mutex<VecDeque> + Condvar).
// Every consumer-side wait in the pipeline goes through `pop_wait`, which wakes
// on data, on timeout, or when its cancel predicate turns true after a
// `wake_all`.
//
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct SafeQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Condvar,
}

impl<T> Default for SafeQueue<T> {
    fn default() -> Self { Self::new() }
}

impl<T> SafeQueue<T> {
    pub fn new() -> Self {
        Self { items: Mutex::new(VecDeque::new()), ready: Condvar::new() }
    }

    // poisoned lock: the deque holds plain data, keep serving
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, item: T) {
        self.lock().push_back(item);
        self.ready.notify_one();
    }

    /// Blocks until an item is available. No timeout.
    pub fn pop(&self) -> T {
        let mut items = self.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            items = self.ready.wait(items).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn try_pop(&self) -> Option<T> { self.lock().pop_front() }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        self.pop_wait(timeout, || false)
    }

    /// Bounded wait. Returns `None` on timeout, or early when `cancel()` is
    /// true at a wake-up and the queue is still empty.
    pub fn pop_wait<F>(&self, timeout: Duration, cancel: F) -> Option<T>
    where
        F: Fn() -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut items = self.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            if cancel() {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .ready
                .wait_timeout(items, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            items = guard;
        }
    }

    /// Wake every parked consumer so it rechecks its cancel predicate.
    pub fn wake_all(&self) {
        // take the lock so a consumer between its cancel check and its wait
        // cannot miss the notification
        let _guard = self.lock();
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize { self.lock().len() }

    pub fn is_empty(&self) -> bool { self.lock().is_empty() }

    pub fn drain(&self) -> Vec<T> { self.lock().drain(..).collect() }
}
