//! Count-down latch for waiting on callbacks that run on worker threads.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Blocks until `count_down` has been called a fixed number of times.
///
/// ```
/// use strand_testing::Latch;
/// use std::time::Duration;
///
/// let latch = Latch::new(2);
/// let remote = latch.clone();
/// std::thread::spawn(move || {
///     remote.count_down();
///     remote.count_down();
/// });
/// assert!(latch.wait(Duration::from_secs(5)));
/// ```
#[derive(Clone, Debug)]
pub struct Latch {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

impl Latch {
    pub fn new(count: usize) -> Self {
        Self {
            inner: Arc::new((Mutex::new(count), Condvar::new())),
        }
    }

    /// Decrement the count, waking waiters when it reaches zero.
    pub fn count_down(&self) {
        let (count, ready) = &*self.inner;
        let mut count = count.lock();
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                ready.notify_all();
            }
        }
    }

    pub fn count(&self) -> usize {
        *self.inner.0.lock()
    }

    /// Wait for the count to reach zero. Returns false on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (count, ready) = &*self.inner;
        let mut count = count.lock();
        while *count > 0 {
            if ready.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}
