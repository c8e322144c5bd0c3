//! One-shot completion latch.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// One-shot, idempotent completion latch.
///
/// `notify` releases all current and future waiters; notifying an already
/// set latch is a no-op.
#[derive(Default)]
pub struct Latch {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cond.notify_all();
    }

    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }

    /// Wait up to `timeout`; returns whether the latch was set.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut done = self.done.lock();
        if !*done {
            self.cond.wait_for(&mut done, timeout);
        }
        *done
    }

    pub fn is_set(&self) -> bool {
        *self.done.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_notify_releases_waiter() {
        let latch = Arc::new(Latch::new());
        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait())
        };
        latch.notify();
        waiter.join().unwrap();
        assert!(latch.is_set());
    }

    #[test]
    fn test_notify_is_idempotent() {
        let latch = Latch::new();
        latch.notify();
        latch.notify();
        assert!(latch.wait_for(Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_for_times_out() {
        let latch = Latch::new();
        assert!(!latch.wait_for(Duration::from_millis(5)));
    }
}
