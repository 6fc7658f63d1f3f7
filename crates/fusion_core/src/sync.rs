//! # Wait Words
//!
//! A 32-bit word that threads can block on until it changes.
//!
//! Waiters spin briefly, then park on a condition variable. Writers update
//! the word and wake every waiter. Used for call reply slots and skirmish
//! locks.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Spins before a waiter parks.
pub const SPIN_LIMIT: u32 = 64;

/// Longest distance of a deadline from now. Longer timeouts are clamped.
pub const MAX_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Returns the instant `timeout` from now without overflowing.
///
/// Timeouts the clock cannot represent (such as [`Duration::MAX`]) wait
/// [`MAX_WAIT`] instead.
#[must_use]
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(MAX_WAIT))
        .unwrap_or(now)
}

/// Blocking word with spin-then-park waits.
#[derive(Debug, Default)]
pub struct WaitWord {
    value: AtomicU32,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl WaitWord {
    /// Creates a word holding `value`.
    #[must_use]
    pub fn new(value: u32) -> Self {
        Self {
            value: AtomicU32::new(value),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// Current value.
    #[inline]
    #[must_use]
    pub fn load(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    /// Stores `value` and wakes every waiter.
    pub fn store(&self, value: u32) {
        // Taking the mutex orders the store against a waiter that is about to park
        let _guard = self.mutex.lock();
        self.value.store(value, Ordering::Release);
        self.condvar.notify_all();
    }

    /// Atomically replaces `current` with `new`, waking waiters on success.
    ///
    /// # Returns
    ///
    /// `true` if the word held `current`.
    pub fn compare_and_store(&self, current: u32, new: u32) -> bool {
        let _guard = self.mutex.lock();
        let swapped = self
            .value
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.condvar.notify_all();
        }
        swapped
    }

    /// Blocks while the word equals `expected`.
    ///
    /// # Arguments
    ///
    /// * `expected` - Value to wait out
    /// * `deadline` - Give up at this instant
    ///
    /// # Returns
    ///
    /// The new value, or `None` if the deadline passed first.
    pub fn wait_while(&self, expected: u32, deadline: Instant) -> Option<u32> {
        for _ in 0..SPIN_LIMIT {
            let value = self.load();
            if value != expected {
                return Some(value);
            }
            std::hint::spin_loop();
        }

        let mut guard = self.mutex.lock();
        loop {
            let value = self.load();
            if value != expected {
                return Some(value);
            }
            if self.condvar.wait_until(&mut guard, deadline).timed_out() {
                let value = self.load();
                return (value != expected).then_some(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_wait_returns_immediately_when_changed() {
        let word = WaitWord::new(3);
        let deadline = Instant::now() + Duration::from_millis(10);
        assert_eq!(word.wait_while(0, deadline), Some(3));
    }

    #[test]
    fn test_wait_times_out() {
        let word = WaitWord::new(0);
        let start = Instant::now();
        assert_eq!(word.wait_while(0, start + Duration::from_millis(20)), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_store_wakes_parked_waiter() {
        let word = Arc::new(WaitWord::new(0));
        let waiter = {
            let word = Arc::clone(&word);
            std::thread::spawn(move || word.wait_while(0, Instant::now() + Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        word.store(7);
        assert_eq!(waiter.join().unwrap(), Some(7));
    }

    #[test]
    fn test_deadline_after_saturates() {
        let before = Instant::now();
        let deadline = deadline_after(Duration::MAX);
        assert!(deadline > before + Duration::from_secs(3600));

        let short = deadline_after(Duration::from_millis(5));
        assert!(short < before + Duration::from_secs(1));
    }

    #[test]
    fn test_compare_and_store() {
        let word = WaitWord::new(1);
        assert!(!word.compare_and_store(0, 2));
        assert!(word.compare_and_store(1, 2));
        assert_eq!(word.load(), 2);
    }
}
