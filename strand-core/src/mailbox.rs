//! Actor mailboxes.
//!
//! A [`Mailbox`] maps handler ids to message handlers, each bound to the
//! context that registered it. [`Mailbox::send`] may be called from any
//! thread; the handler always runs on its owning context, so a handler can
//! touch that context's state without synchronization.
//!
//! ```no_run
//! # use strand_core::{Runtime, RuntimeConfig};
//! # let runtime = Runtime::new(RuntimeConfig::new()).unwrap();
//! let mailbox = runtime.mailbox::<String>();
//! let context = runtime.create_context();
//! let id = mailbox
//!     .register(context, |msg: String| println!("got {}", msg))
//!     .unwrap();
//!
//! mailbox.send(id, "hello".to_string());
//! mailbox.unregister(id);
//! ```

use crate::context::ContextId;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// Identifier of a registered handler, unique within its mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    /// Rebuild an id previously obtained from [`HandlerId::as_u64`].
    #[inline]
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

type BoxedHandler<M> = Arc<dyn Fn(M) + Send + Sync + 'static>;

struct Entry<M> {
    handler: BoxedHandler<M>,
    context: ContextId,
}

struct Inner<M> {
    dispatcher: Dispatcher,
    next_id: AtomicU64,
    entries: Mutex<HashMap<HandlerId, Entry<M>>>,
}

/// Registry of context-bound message handlers for messages of type `M`.
///
/// Cloning shares the same registry.
pub struct Mailbox<M> {
    inner: Arc<Inner<M>>,
}

impl<M> Clone for Mailbox<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M> fmt::Debug for Mailbox<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("handlers", &self.inner.entries.lock().len())
            .finish()
    }
}

impl<M: Send + 'static> Mailbox<M> {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatcher,
                next_id: AtomicU64::new(1),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register `handler` on `context`.
    ///
    /// Fails with [`Error::UnboundExecution`] if `context` is not a live
    /// context of this runtime.
    pub fn register<F>(&self, context: ContextId, handler: F) -> Result<HandlerId>
    where
        F: Fn(M) + Send + Sync + 'static,
    {
        if !self.inner.dispatcher.registry().contains(context) {
            return Err(Error::UnboundExecution("mailbox register"));
        }

        let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.entries.lock().insert(
            id,
            Entry {
                handler: Arc::new(handler),
                context,
            },
        );
        trace!(handler_id = %id, context = %context, "handler registered");
        Ok(id)
    }

    /// Register `handler` on the caller's current context.
    pub fn register_current<F>(&self, handler: F) -> Result<HandlerId>
    where
        F: Fn(M) + Send + Sync + 'static,
    {
        let context = self.inner.dispatcher.require_context("mailbox register")?;
        self.register(context, handler)
    }

    /// Remove a handler. Unknown or already removed ids are ignored.
    ///
    /// Returns whether a handler was removed. Messages already queued for the
    /// handler are discarded when they reach its context.
    pub fn unregister(&self, id: HandlerId) -> bool {
        let removed = self.inner.entries.lock().remove(&id).is_some();
        if removed {
            trace!(handler_id = %id, "handler unregistered");
        }
        removed
    }

    /// Deliver `message` to handler `id` on its owning context.
    ///
    /// Runs before returning when the caller is on that context. Messages for
    /// unknown ids are dropped.
    pub fn send(&self, id: HandlerId, message: M) {
        let context = match self.inner.entries.lock().get(&id) {
            Some(entry) => entry.context,
            None => {
                trace!(handler_id = %id, "no handler registered, message dropped");
                return;
            }
        };

        let inner = Arc::clone(&self.inner);
        let delivery = move || {
            // Looked up again on the owning context so an unregister issued
            // there before this point wins.
            let handler = inner
                .entries
                .lock()
                .get(&id)
                .map(|entry| Arc::clone(&entry.handler));
            match handler {
                Some(handler) => handler(message),
                None => trace!(handler_id = %id, "handler removed before delivery"),
            }
        };

        if let Err(e) = self.inner.dispatcher.run_on(context, delivery) {
            debug!(handler_id = %id, context = %context, error = %e, "message delivery failed");
        }
    }

    pub fn contains(&self, id: HandlerId) -> bool {
        self.inner.entries.lock().contains_key(&id)
    }

    /// Context a handler is bound to.
    pub fn context_of(&self, id: HandlerId) -> Option<ContextId> {
        self.inner.entries.lock().get(&id).map(|entry| entry.context)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
