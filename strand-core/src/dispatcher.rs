//! Thread-affinity dispatcher.
//!
//! Routes work to the worker a context is pinned to. [`Dispatcher::run_on`]
//! runs inline when the caller is already executing on the target context,
//! which keeps a context's own follow-up work synchronous; everything else
//! is queued FIFO on the target worker.

use crate::context::{ContextId, ContextRegistry};
use crate::error::{Error, Result};
use crate::worker::{Command, WorkerPool};
use futures_util::FutureExt;
use std::future::Future;
use std::sync::Arc;

/// Cheap, cloneable handle for submitting work to contexts.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ContextRegistry>,
    workers: Arc<WorkerPool>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("contexts", &self.registry.len())
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl Dispatcher {
    pub(crate) fn new(registry: Arc<ContextRegistry>, workers: Arc<WorkerPool>) -> Self {
        Self { registry, workers }
    }

    #[inline]
    pub fn registry(&self) -> &Arc<ContextRegistry> {
        &self.registry
    }

    #[inline]
    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    /// Context bound to the calling thread by this runtime.
    #[inline]
    pub fn current_context(&self) -> Option<ContextId> {
        self.registry.current()
    }

    /// Current context, or [`Error::UnboundExecution`] naming `operation`.
    #[inline]
    pub fn require_context(&self, operation: &'static str) -> Result<ContextId> {
        self.current_context()
            .ok_or(Error::UnboundExecution(operation))
    }

    /// True when the caller is executing on `context`.
    #[inline]
    pub fn is_on(&self, context: ContextId) -> bool {
        self.current_context() == Some(context)
    }

    /// Run `work` on `context`.
    ///
    /// Executes before returning when the caller is already on `context`.
    /// Otherwise the work is queued behind everything previously submitted to
    /// the context's worker.
    pub fn run_on<F>(&self, context: ContextId, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_on(context) {
            work();
            return Ok(());
        }
        self.post(context, work)
    }

    /// Queue `work` on `context`, never running it inline.
    pub fn post<F>(&self, context: ContextId, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let worker = self
            .registry
            .worker_of(context)
            .ok_or(Error::ContextNotFound(context))?;
        self.workers.submit(
            worker,
            Command::Run {
                context,
                work: Box::new(work),
            },
        )
    }

    /// Start a future on `context`'s worker.
    ///
    /// `make` is sent to the worker and called there, so the future itself
    /// need not be `Send`. The context stays bound across every poll.
    pub fn spawn_on<F, Fut>(&self, context: ContextId, make: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let worker = self
            .registry
            .worker_of(context)
            .ok_or(Error::ContextNotFound(context))?;
        self.workers.submit(
            worker,
            Command::Spawn {
                context,
                task: Box::new(move || make().boxed_local()),
            },
        )
    }

    /// Fail with [`Error::AffinityViolation`] unless running on `context`.
    pub fn assert_affinity(&self, context: ContextId) -> Result<()> {
        let actual = self.current_context();
        if actual == Some(context) {
            Ok(())
        } else {
            Err(Error::AffinityViolation {
                expected: context,
                actual,
            })
        }
    }
}
