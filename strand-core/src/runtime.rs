//! The runtime: worker pool, context registry and dispatcher in one handle.

use crate::config::RuntimeConfig;
use crate::context::{ContextId, ContextRegistry, RuntimeId};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::mailbox::Mailbox;
use crate::worker::WorkerPool;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

struct RuntimeInner {
    config: RuntimeConfig,
    dispatcher: Dispatcher,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.dispatcher.workers().shutdown();
    }
}

/// Handle to a running set of workers.
///
/// Clones share the same runtime. Workers stop on [`shutdown`](Self::shutdown)
/// or when the last handle is dropped.
///
/// ```no_run
/// use strand_core::{Runtime, RuntimeConfig};
///
/// let runtime = Runtime::new(RuntimeConfig::new().workers(2))?;
/// let context = runtime.create_context();
/// runtime.run_on(context, move || {
///     println!("running on {:?}", strand_core::current_context());
/// })?;
/// runtime.shutdown();
/// # Ok::<(), strand_core::Error>(())
/// ```
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Runtime {
    /// Start the workers described by `config`.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;

        let workers = config.effective_workers();
        let registry = Arc::new(ContextRegistry::new(RuntimeId::next(), workers));
        let pool = Arc::new(WorkerPool::start(Arc::clone(&registry), &config)?);
        let dispatcher = Dispatcher::new(registry, pool);

        info!(workers, thread_name = %config.thread_name, "runtime started");
        Ok(Self {
            inner: Arc::new(RuntimeInner { config, dispatcher }),
        })
    }

    /// Start a runtime from `STRAND_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(RuntimeConfig::from_env()?)
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    #[inline]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    #[inline]
    pub fn registry(&self) -> &Arc<ContextRegistry> {
        self.inner.dispatcher.registry()
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.inner.dispatcher.workers().len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.dispatcher.workers().is_running()
    }

    /// Create a context; see [`ContextRegistry::create`] for worker choice.
    pub fn create_context(&self) -> ContextId {
        self.registry().create()
    }

    pub fn destroy_context(&self, context: ContextId) -> bool {
        self.registry().destroy(context)
    }

    #[inline]
    pub fn current_context(&self) -> Option<ContextId> {
        self.inner.dispatcher.current_context()
    }

    pub fn run_on<F>(&self, context: ContextId, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.dispatcher.run_on(context, work)
    }

    pub fn post<F>(&self, context: ContextId, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.dispatcher.post(context, work)
    }

    pub fn spawn_on<F, Fut>(&self, context: ContextId, make: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        self.inner.dispatcher.spawn_on(context, make)
    }

    /// Run `work` on a fresh context and return that context.
    ///
    /// The usual entry point: code running inside `work` can create servers,
    /// acquire connections and register handlers, all of which need a
    /// current context.
    pub fn execute<F>(&self, work: F) -> Result<ContextId>
    where
        F: FnOnce() + Send + 'static,
    {
        let context = self.create_context();
        if let Err(e) = self.post(context, work) {
            self.destroy_context(context);
            return Err(e);
        }
        Ok(context)
    }

    /// A new mailbox for messages of type `M` on this runtime.
    pub fn mailbox<M: Send + 'static>(&self) -> Mailbox<M> {
        Mailbox::new(self.inner.dispatcher.clone())
    }

    /// Stop all workers. Later submissions fail with
    /// [`Error::RuntimeShutdown`](crate::Error::RuntimeShutdown).
    pub fn shutdown(&self) {
        if self.is_running() {
            info!("runtime shutting down");
        }
        self.inner.dispatcher.workers().shutdown();
    }
}
