//! Execution contexts.
//!
//! A context is a long-lived logical execution identity pinned to exactly one
//! worker thread for its whole life. Work submitted to a context runs on that
//! worker, one item at a time, in submission order, which lets the state a
//! context owns go without locks.
//!
//! ```text
//!   ContextRegistry
//!   ┌──────────┬──────────┐
//!   │ ctx-1    │ worker-0 │ ──┐
//!   │ ctx-2    │ worker-1 │   │  many contexts
//!   │ ctx-3    │ worker-0 │ ──┘  share one worker
//!   └──────────┴──────────┘
//! ```
//!
//! While a worker runs work for a context, the pair (runtime, context) is
//! bound to the worker thread; [`current_context`] reads that binding.

use crate::worker::{self, WorkerId};
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::ThreadId;
use tracing::trace;

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque context identifier, unique within a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Identity of one runtime instance.
///
/// Thread bindings carry it so that two runtimes in one process never
/// mistake each other's contexts for their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RuntimeId(u64);

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

impl RuntimeId {
    pub(crate) fn next() -> Self {
        Self(NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed))
    }
}

// ============================================================================
// Current Context Binding
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    runtime: RuntimeId,
    context: ContextId,
}

thread_local! {
    static CURRENT: Cell<Option<Binding>> = const { Cell::new(None) };
}

/// The context whose work is running on this thread, if any.
///
/// Returns `None` outside worker threads and on a worker between work items.
#[inline]
pub fn current_context() -> Option<ContextId> {
    CURRENT.with(|c| c.get()).map(|b| b.context)
}

#[inline]
fn current_binding(runtime: RuntimeId) -> Option<ContextId> {
    CURRENT
        .with(|c| c.get())
        .filter(|b| b.runtime == runtime)
        .map(|b| b.context)
}

/// Binds a context to the current thread until dropped, then restores the
/// previous binding.
pub(crate) struct ContextGuard {
    previous: Option<Binding>,
}

impl ContextGuard {
    pub(crate) fn enter(runtime: RuntimeId, context: ContextId) -> Self {
        let previous = CURRENT.with(|c| c.replace(Some(Binding { runtime, context })));
        Self { previous }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.previous));
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug)]
struct ContextEntry {
    worker: WorkerId,
    /// Set the first time the worker runs work for this context
    thread: Option<ThreadId>,
}

/// Registry of live contexts and the worker each one is pinned to.
///
/// Lookups are safe from any thread. The worker of a context never changes
/// between creation and destruction.
#[derive(Debug)]
pub struct ContextRegistry {
    runtime: RuntimeId,
    worker_count: usize,
    next_id: AtomicU64,
    next_worker: AtomicUsize,
    contexts: Mutex<HashMap<ContextId, ContextEntry>>,
}

impl ContextRegistry {
    pub(crate) fn new(runtime: RuntimeId, worker_count: usize) -> Self {
        Self {
            runtime,
            worker_count: worker_count.max(1),
            next_id: AtomicU64::new(1),
            next_worker: AtomicUsize::new(0),
            contexts: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub(crate) fn runtime_id(&self) -> RuntimeId {
        self.runtime
    }

    /// Number of workers contexts are spread over.
    #[inline]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Create a context.
    ///
    /// Called from one of this runtime's workers, the new context is pinned
    /// to that same worker so the caller and the new context share a thread.
    /// Anywhere else, workers are assigned round-robin.
    pub fn create(&self) -> ContextId {
        let worker = worker::current_worker(self.runtime).unwrap_or_else(|| self.next_worker());
        self.insert(worker)
    }

    /// Create a context on the next worker in round-robin order, regardless
    /// of the calling thread.
    pub fn create_round_robin(&self) -> ContextId {
        let worker = self.next_worker();
        self.insert(worker)
    }

    fn next_worker(&self) -> WorkerId {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.worker_count;
        WorkerId::new(index)
    }

    fn insert(&self, worker: WorkerId) -> ContextId {
        let id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.contexts.lock().insert(
            id,
            ContextEntry {
                worker,
                thread: None,
            },
        );
        trace!(context = %id, worker = %worker, "context created");
        id
    }

    /// Remove a context. Work already queued for it still runs; new
    /// submissions fail. Returns false if the context was unknown.
    pub fn destroy(&self, id: ContextId) -> bool {
        let removed = self.contexts.lock().remove(&id).is_some();
        if removed {
            trace!(context = %id, "context destroyed");
        }
        removed
    }

    #[inline]
    pub fn contains(&self, id: ContextId) -> bool {
        self.contexts.lock().contains_key(&id)
    }

    /// Worker the context is pinned to.
    #[inline]
    pub fn worker_of(&self, id: ContextId) -> Option<WorkerId> {
        self.contexts.lock().get(&id).map(|entry| entry.worker)
    }

    /// Thread the context has run on, once it has run anything.
    pub fn bound_thread(&self, id: ContextId) -> Option<ThreadId> {
        self.contexts.lock().get(&id).and_then(|entry| entry.thread)
    }

    pub(crate) fn bind_thread(&self, id: ContextId, thread: ThreadId) {
        if let Some(entry) = self.contexts.lock().get_mut(&id) {
            let bound = *entry.thread.get_or_insert(thread);
            debug_assert_eq!(bound, thread, "{} ran on two threads", id);
        }
    }

    /// The context of this runtime bound to the calling thread.
    #[inline]
    pub fn current(&self) -> Option<ContextId> {
        current_binding(self.runtime)
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
