//! Runtime wrapper for blocking tests.

use std::ops::Deref;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use strand_core::{ContextId, Runtime, RuntimeConfig};

/// How long the blocking helpers wait before failing the test.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A [`Runtime`] that shuts down when dropped and can run closures on a
/// context and hand back their result.
///
/// Helpers panic on timeout or dispatch failure; they are meant for tests.
#[derive(Debug)]
pub struct TestRuntime {
    runtime: Runtime,
}

impl TestRuntime {
    /// Runtime with `workers` threads named `strand-test-N`.
    pub fn new(workers: usize) -> Self {
        Self::with_config(RuntimeConfig::new().workers(workers).thread_name("strand-test"))
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let runtime = Runtime::new(config).expect("failed to start test runtime");
        Self { runtime }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Run `work` on `context` and wait for its result.
    pub fn run_in_context<T, F>(&self, context: ContextId, work: F) -> T
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.runtime
            .run_on(context, move || {
                let _ = tx.send(work());
            })
            .expect("failed to dispatch to context");
        rx.recv_timeout(DEFAULT_TIMEOUT)
            .expect("context did not run work in time")
    }

    /// Create a context, run `work` there and wait for its result.
    pub fn run_in_new_context<T, F>(&self, work: F) -> (ContextId, T)
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let context = self.runtime.create_context();
        let value = self.run_in_context(context, work);
        (context, value)
    }
}

impl Deref for TestRuntime {
    type Target = Runtime;

    fn deref(&self) -> &Runtime {
        &self.runtime
    }
}

impl Drop for TestRuntime {
    fn drop(&mut self) {
        self.runtime.shutdown();
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::current_context;

    #[test]
    fn test_run_in_new_context_returns_value() {
        let runtime = TestRuntime::new(2);
        let (context, seen) = runtime.run_in_new_context(current_context);
        assert_eq!(seen, Some(context));
    }

    #[test]
    fn test_deref_exposes_runtime() {
        let runtime = TestRuntime::new(3);
        assert_eq!(runtime.worker_count(), 3);
        assert!(runtime.is_running());
    }

    #[test]
    fn test_eventually() {
        let mut calls = 0;
        assert!(eventually(Duration::from_secs(1), || {
            calls += 1;
            calls == 3
        }));
        assert!(!eventually(Duration::from_millis(20), || false));
    }
}
