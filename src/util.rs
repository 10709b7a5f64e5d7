use std::any::Any;

use parking_lot::{Condvar, Mutex};

// -----------------------------------------------------------------------------
// Counting semaphore

/// A counting semaphore built from a mutex and a condition variable. Workers
/// park on it while the scheduler is not running.
///
/// Permits accumulate: releasing more permits than there are waiters lets
/// later calls to `acquire` return immediately.
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Creates a semaphore holding the given number of permits.
    pub const fn new(permits: usize) -> Semaphore {
        Semaphore {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Blocks the thread until a permit is available, then takes it.
    pub fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// The number of permits currently available.
    #[cfg(test)]
    pub fn available(&self) -> usize {
        *self.permits.lock()
    }

    /// Adds `count` permits, waking up to `count` blocked threads.
    pub fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut permits = self.permits.lock();
        *permits += count;
        if count == 1 {
            self.available.notify_one();
        } else {
            self.available.notify_all();
        }
    }
}

// -----------------------------------------------------------------------------
// Panic payloads

/// Extracts a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}
