// ===============================
// src/state.rs
// ===============================
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;
use tracing::{error, info};

/// Run/broken flags shared by every stage.
///
/// `running` is flipped false once by the coordinator. `broken` is a one-way
/// latch any stage may set on a fatal condition; the condvar exists so the
/// coordinator can sleep until it happens instead of spinning.
#[derive(Debug)]
pub struct SystemState {
    running: AtomicBool,
    broken: AtomicBool,
    broken_lock: Mutex<()>,
    broken_cv: Condvar,
}

impl Default for SystemState {
    fn default() -> Self { Self::new() }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            broken: AtomicBool::new(false),
            broken_lock: Mutex::new(()),
            broken_cv: Condvar::new(),
        }
    }

    pub fn is_running(&self) -> bool { self.running.load(Ordering::Acquire) }

    pub fn is_broken(&self) -> bool { self.broken.load(Ordering::Acquire) }

    /// Loop condition for every stage.
    pub fn should_run(&self) -> bool { self.is_running() && !self.is_broken() }

    /// Returns true only for the call that actually flipped `running`.
    pub fn request_stop(&self) -> bool {
        let flipped = self.running.swap(false, Ordering::AcqRel);
        if flipped {
            info!("stop requested");
        }
        flipped
    }

    /// Latch the broken flag and wake the coordinator. Returns true for the
    /// first caller only.
    pub fn mark_broken(&self, reason: &str) -> bool {
        let _guard = self.broken_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let first = !self.broken.swap(true, Ordering::AcqRel);
        if first {
            error!(%reason, "system marked broken");
        }
        self.broken_cv.notify_all();
        first
    }

    /// Sleep until broken or until `timeout` elapses. Returns the flag.
    pub fn wait_broken(&self, timeout: Duration) -> bool {
        self.wait_broken_or(timeout, || false)
    }

    /// Like `wait_broken`, but a `wake()` also ends the wait once `stop()`
    /// is true. Callers set their flag before calling `wake()`.
    pub fn wait_broken_or<F>(&self, timeout: Duration, stop: F) -> bool
    where
        F: Fn() -> bool,
    {
        let guard = self.broken_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (_guard, _) = self
            .broken_cv
            .wait_timeout_while(guard, timeout, |_| !self.broken.load(Ordering::Acquire) && !stop())
            .unwrap_or_else(PoisonError::into_inner);
        self.is_broken()
    }

    pub fn wake(&self) {
        let _guard = self.broken_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.broken_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn starts_running_and_not_broken() {
        let st = SystemState::new();
        assert!(st.is_running());
        assert!(!st.is_broken());
        assert!(st.should_run());
    }

    #[test]
    fn request_stop_flips_once() {
        let st = SystemState::new();
        assert!(st.request_stop());
        assert!(!st.request_stop());
        assert!(!st.should_run());
        assert!(!st.is_broken());
    }

    #[test]
    fn broken_latch_never_resets() {
        let st = SystemState::new();
        assert!(st.mark_broken("first"));
        assert!(!st.mark_broken("second"));
        assert!(st.is_broken());
        assert!(st.is_running());
        assert!(!st.should_run());
    }

    #[test]
    fn wait_broken_times_out_when_healthy() {
        let st = SystemState::new();
        let started = Instant::now();
        assert!(!st.wait_broken(Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn wait_broken_wakes_promptly() {
        let st = Arc::new(SystemState::new());
        let waiter = {
            let st = st.clone();
            thread::spawn(move || {
                let started = Instant::now();
                (st.wait_broken(Duration::from_secs(10)), started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(30));
        st.mark_broken("test");
        let (broken, waited) = waiter.join().unwrap();
        assert!(broken);
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn wake_ends_wait_once_stop_flag_is_set() {
        let st = Arc::new(SystemState::new());
        let interrupted = Arc::new(AtomicBool::new(false));
        let waiter = {
            let st = st.clone();
            let interrupted = interrupted.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let broken = st.wait_broken_or(Duration::from_secs(10), || interrupted.load(Ordering::Acquire));
                (broken, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(30));
        interrupted.store(true, Ordering::Release);
        st.wake();
        let (broken, waited) = waiter.join().unwrap();
        assert!(!broken);
        assert!(waited < Duration::from_secs(5));
    }
}
