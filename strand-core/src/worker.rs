//! Worker Threads
//!
//! Each worker is a dedicated OS thread driving a single-threaded tokio
//! runtime with a [`LocalSet`]. Work reaches a worker through an unbounded
//! FIFO command queue, so items submitted to the same worker from the same
//! thread run in submission order.
//!
//! ```text
//! submit(worker-1, Run{ctx-4, f}) ──► [ queue ] ──► worker-1 thread
//!                                                   ├─ bind ctx-4
//!                                                   ├─ f()
//!                                                   └─ unbind
//! ```
//!
//! Futures spawned onto a worker run as local tasks and may hold `!Send`
//! state such as connection halves.

use crate::config::RuntimeConfig;
use crate::context::{ContextGuard, ContextId, ContextRegistry, RuntimeId};
use crate::error::{Error, Result};
use futures_util::future::LocalBoxFuture;
use parking_lot::Mutex;
use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context as TaskContext, Poll};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::{debug, error, warn};

// ============================================================================
// Worker Identity
// ============================================================================

/// Index of a worker within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(usize);

impl WorkerId {
    #[inline]
    pub(crate) const fn new(index: usize) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

thread_local! {
    /// Worker identity of the current thread
    static CURRENT_WORKER: Cell<Option<(RuntimeId, WorkerId)>> = const { Cell::new(None) };
}

/// The worker of `runtime` running on this thread.
#[inline]
pub(crate) fn current_worker(runtime: RuntimeId) -> Option<WorkerId> {
    CURRENT_WORKER
        .with(|w| w.get())
        .filter(|(owner, _)| *owner == runtime)
        .map(|(_, id)| id)
}

// ============================================================================
// Commands
// ============================================================================

pub(crate) type Work = Box<dyn FnOnce() + Send + 'static>;
pub(crate) type SpawnTask = Box<dyn FnOnce() -> LocalBoxFuture<'static, ()> + Send + 'static>;

pub(crate) enum Command {
    /// Run a closure with the context bound
    Run { context: ContextId, work: Work },
    /// Build a future with the context bound and drive it as a local task
    Spawn { context: ContextId, task: SpawnTask },
    Shutdown,
}

/// Future wrapper that binds a context around every poll.
pub(crate) struct ContextScope {
    runtime: RuntimeId,
    context: ContextId,
    future: LocalBoxFuture<'static, ()>,
}

impl Future for ContextScope {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<()> {
        let _guard = ContextGuard::enter(self.runtime, self.context);
        self.future.as_mut().poll(cx)
    }
}

// ============================================================================
// Worker Statistics
// ============================================================================

/// Per-worker counters.
#[derive(Debug, Default)]
pub struct WorkerStats {
    executed: AtomicU64,
    spawned: AtomicU64,
    panicked: AtomicU64,
}

impl WorkerStats {
    #[inline]
    fn record_run(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_spawn(&self) {
        self.spawned.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_panic(&self) {
        self.panicked.fetch_add(1, Ordering::Relaxed);
    }

    /// Closures run to completion or panic
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Futures spawned as local tasks
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Closures or task factories that panicked
    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Worker Pool
// ============================================================================

struct WorkerHandle {
    id: WorkerId,
    sender: mpsc::UnboundedSender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<WorkerStats>,
}

/// Fixed set of worker threads, started with the runtime and stopped with it.
pub struct WorkerPool {
    runtime: RuntimeId,
    workers: Vec<WorkerHandle>,
    running: AtomicBool,
}

impl WorkerPool {
    pub(crate) fn start(registry: Arc<ContextRegistry>, config: &RuntimeConfig) -> Result<Self> {
        let runtime = registry.runtime_id();
        let count = registry.worker_count();
        let mut pool = Self {
            runtime,
            workers: Vec::with_capacity(count),
            running: AtomicBool::new(true),
        };

        for index in 0..count {
            let id = WorkerId::new(index);
            let (sender, receiver) = mpsc::unbounded_channel();
            let stats = Arc::new(WorkerStats::default());

            let mut builder = thread::Builder::new().name(format!("{}-{}", config.thread_name, index));
            if let Some(size) = config.stack_size {
                builder = builder.stack_size(size);
            }

            let thread_registry = Arc::clone(&registry);
            let thread_stats = Arc::clone(&stats);
            let spawned =
                builder.spawn(move || worker_main(thread_registry, id, receiver, thread_stats));

            match spawned {
                Ok(handle) => pool.workers.push(WorkerHandle {
                    id,
                    sender,
                    thread: Mutex::new(Some(handle)),
                    stats,
                }),
                Err(e) => {
                    error!(worker = %id, error = %e, "failed to spawn worker thread");
                    pool.shutdown();
                    return Err(Error::Io(e));
                }
            }
        }

        Ok(pool)
    }

    /// Number of workers.
    #[inline]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Counters for one worker.
    pub fn stats(&self, worker: WorkerId) -> Option<&WorkerStats> {
        self.workers.get(worker.index()).map(|w| w.stats.as_ref())
    }

    /// The worker of this pool running on the calling thread.
    pub fn current(&self) -> Option<WorkerId> {
        current_worker(self.runtime)
    }

    pub(crate) fn submit(&self, worker: WorkerId, command: Command) -> Result<()> {
        if !self.is_running() {
            return Err(Error::RuntimeShutdown);
        }
        let handle = self.workers.get(worker.index()).ok_or(Error::RuntimeShutdown)?;
        handle
            .sender
            .send(command)
            .map_err(|_| Error::RuntimeShutdown)
    }

    /// Stop every worker and join its thread.
    ///
    /// Queued work that has not started is dropped. The calling thread is
    /// never joined, so shutting down from inside a worker is allowed.
    /// Calling this more than once is a no-op.
    pub(crate) fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        for worker in &self.workers {
            let _ = worker.sender.send(Command::Shutdown);
        }

        let me = thread::current().id();
        for worker in &self.workers {
            let Some(handle) = worker.thread.lock().take() else {
                continue;
            };
            if handle.thread().id() == me {
                debug!(worker = %worker.id, "shutdown requested from worker, skipping self join");
                continue;
            }
            if handle.join().is_err() {
                warn!(worker = %worker.id, "worker thread panicked during shutdown");
            }
        }
        debug!(workers = self.workers.len(), "worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Worker Loop
// ============================================================================

fn worker_main(
    registry: Arc<ContextRegistry>,
    id: WorkerId,
    mut receiver: mpsc::UnboundedReceiver<Command>,
    stats: Arc<WorkerStats>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(worker = %id, error = %e, "failed to build worker runtime");
            return;
        }
    };

    let runtime = registry.runtime_id();
    CURRENT_WORKER.with(|w| w.set(Some((runtime, id))));
    debug!(worker = %id, "worker started");

    let local = LocalSet::new();
    local.block_on(&rt, async {
        while let Some(command) = receiver.recv().await {
            match command {
                Command::Run { context, work } => {
                    registry.bind_thread(context, thread::current().id());
                    let _guard = ContextGuard::enter(runtime, context);
                    if panic::catch_unwind(AssertUnwindSafe(work)).is_err() {
                        stats.record_panic();
                        error!(worker = %id, context = %context, "work item panicked");
                    }
                    stats.record_run();
                }
                Command::Spawn { context, task } => {
                    registry.bind_thread(context, thread::current().id());
                    let future = {
                        let _guard = ContextGuard::enter(runtime, context);
                        panic::catch_unwind(AssertUnwindSafe(task))
                    };
                    match future {
                        Ok(future) => {
                            stats.record_spawn();
                            tokio::task::spawn_local(ContextScope {
                                runtime,
                                context,
                                future,
                            });
                        }
                        Err(_) => {
                            stats.record_panic();
                            error!(worker = %id, context = %context, "task factory panicked");
                        }
                    }
                }
                Command::Shutdown => break,
            }
        }
    });

    // Dropping the LocalSet cancels the remaining local tasks
    drop(local);
    CURRENT_WORKER.with(|w| w.set(None));
    debug!(worker = %id, "worker stopped");
}
