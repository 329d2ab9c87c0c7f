//! Context-aware connection pool.
//!
//! One pool serves one [`Endpoint`]. Requests come from execution contexts
//! and results are always delivered back to the requesting context, never
//! inline from [`ConnectionPool::acquire`], even when an idle connection is
//! available.
//!
//! Admission, for a request from context `C`:
//!
//! 1. an idle connection is re-pinned to `C` and handed over;
//! 2. otherwise, if fewer than `max_size` connections exist, a new one is
//!    opened on `C`'s worker;
//! 3. otherwise the request waits in FIFO order.
//!
//! Released keep-alive connections go to the oldest waiter first. When a
//! connection closes, its slot goes to the oldest waiter by opening a new
//! connection on that waiter's context.
//!
//! All counters, the idle queue, the waiter queue and each connection's
//! lease sit behind a single lock, so the live-connection count can never
//! exceed `max_size`, even transiently, and a connection is held by at most
//! one context at a time.

use crate::connection::{Connection, ConnectionId};
use crate::endpoint::Endpoint;
use crate::transport::Transport;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use strand_core::{ContextId, Dispatcher, Error, Result, current_context};
use tracing::{debug, error, trace, warn};

/// Receives the outcome of an acquisition on the requesting context.
pub type ConnectHandler = Box<dyn FnOnce(Result<Connection>) + Send + 'static>;

type ExceptionHandler = Arc<dyn Fn(&Error) + Send + Sync + 'static>;

/// Pool sizing and reuse policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Upper bound on live connections (at least 1)
    pub max_size: usize,
    /// Keep released connections for reuse instead of closing them
    pub keep_alive: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 1,
            keep_alive: true,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::Config("max_pool_size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Live connections, including ones still connecting
    pub active: usize,
    /// Idle connections ready for reuse
    pub available: usize,
    /// Requests waiting for a connection
    pub waiting: usize,
    /// Connections successfully opened over the pool's lifetime
    pub created: u64,
    /// Hand-offs of an existing connection
    pub reused: u64,
    /// Failed connect attempts
    pub failed: u64,
}

struct Waiter {
    context: ContextId,
    handler: ConnectHandler,
}

/// Who may use a live connection right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lease {
    /// Held by a context, which alone may release it
    Held(ContextId),
    /// In the idle queue
    Idle,
    /// Released without keep-alive, or after the pool closed; closing
    Retired,
}

struct Slot {
    connection: Connection,
    lease: Lease,
}

enum CheckIn {
    HandOff(Waiter),
    Idle,
    Close,
}

#[derive(Default)]
struct PoolState {
    available: VecDeque<Connection>,
    waiters: VecDeque<Waiter>,
    live: HashMap<ConnectionId, Slot>,
    active: usize,
    closed: bool,
}

enum Admission {
    Reuse(Connection, Waiter),
    Connect(Waiter),
    Queued,
}

struct PoolInner {
    endpoint: Endpoint,
    config: PoolConfig,
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    state: Mutex<PoolState>,
    exception_handler: Mutex<Option<ExceptionHandler>>,
    created: AtomicU64,
    reused: AtomicU64,
    failed: AtomicU64,
}

/// Bounded pool of connections to one endpoint.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.inner.endpoint)
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(
        dispatcher: Dispatcher,
        endpoint: Endpoint,
        transport: Arc<dyn Transport>,
        config: PoolConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                endpoint,
                config,
                transport,
                dispatcher,
                state: Mutex::new(PoolState::default()),
                exception_handler: Mutex::new(None),
                created: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        })
    }

    #[inline]
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    #[inline]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Handler for connect failures; replaces the default, which logs.
    pub fn exception_handler<F>(&self, handler: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        *self.inner.exception_handler.lock() = Some(Arc::new(handler));
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            active: state.active,
            available: state.available.len(),
            waiting: state.waiters.len(),
            created: self.inner.created.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Request a connection for the current context.
    ///
    /// `handler` later runs on the current context with the connection, or
    /// with the error if opening one failed. Fails immediately with
    /// [`Error::UnboundExecution`] outside a context.
    pub fn acquire<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(Result<Connection>) + Send + 'static,
    {
        let context = self.inner.dispatcher.require_context("connection acquire")?;
        self.acquire_on(context, handler)
    }

    /// Request a connection on behalf of `context`.
    pub fn acquire_on<F>(&self, context: ContextId, handler: F) -> Result<()>
    where
        F: FnOnce(Result<Connection>) + Send + 'static,
    {
        if !self.inner.dispatcher.registry().contains(context) {
            return Err(Error::UnboundExecution("connection acquire"));
        }

        let waiter = Waiter {
            context,
            handler: Box::new(handler),
        };

        let admission = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::PoolClosed);
            }
            if let Some(connection) = state.available.pop_front() {
                state.lease(connection.id(), Lease::Held(context));
                Admission::Reuse(connection, waiter)
            } else if state.active < self.inner.config.max_size {
                state.active += 1;
                // Older waiters keep their place ahead of this request
                match state.waiters.pop_front() {
                    Some(front) => {
                        state.waiters.push_back(waiter);
                        Admission::Connect(front)
                    }
                    None => Admission::Connect(waiter),
                }
            } else {
                state.waiters.push_back(waiter);
                Admission::Queued
            }
        };

        match admission {
            Admission::Reuse(connection, waiter) => self.hand_off(connection, waiter),
            Admission::Connect(waiter) => self.connect(waiter),
            Admission::Queued => {
                trace!(endpoint = %self.inner.endpoint, context = %context, "pool exhausted, request queued");
            }
        }
        Ok(())
    }

    /// Return a connection obtained from this pool.
    ///
    /// Must be called on the context holding the connection. Keep-alive
    /// connections go to the oldest waiter or back to the idle queue; others
    /// are closed, which frees their slot.
    pub fn release(&self, connection: Connection) -> Result<()> {
        let caller = self.inner.dispatcher.require_context("connection release")?;
        self.check_in(connection, Some(caller))
    }

    /// Check the lease, clear the handlers and pick the connection's next
    /// holder in one critical section. `caller` of `None` skips the holder
    /// check.
    fn check_in(&self, connection: Connection, caller: Option<ContextId>) -> Result<()> {
        let id = connection.id();
        let next = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let closed = state.closed;
            let slot = state.live.get_mut(&id).ok_or_else(|| {
                Error::Config(format!(
                    "connection {} does not belong to the pool for {}",
                    id, self.inner.endpoint
                ))
            })?;
            match (slot.lease, caller) {
                (Lease::Held(holder), Some(caller)) if holder != caller => {
                    return Err(Error::AffinityViolation {
                        expected: holder,
                        actual: Some(caller),
                    });
                }
                (Lease::Held(_), _) => {}
                (Lease::Idle | Lease::Retired, _) => {
                    return Err(Error::Config(format!("connection {} was already released", id)));
                }
            }
            if !connection.is_open() {
                return Err(Error::ConnectionClosed);
            }

            connection.clear_handlers();
            if closed || !connection.keep_alive() {
                slot.lease = Lease::Retired;
                CheckIn::Close
            } else if let Some(waiter) = state.waiters.pop_front() {
                slot.lease = Lease::Held(waiter.context);
                CheckIn::HandOff(waiter)
            } else {
                slot.lease = Lease::Idle;
                state.available.push_back(connection.clone());
                CheckIn::Idle
            }
        };

        match next {
            CheckIn::HandOff(waiter) => self.hand_off(connection, waiter),
            CheckIn::Idle => {}
            CheckIn::Close => {
                trace!(connection = id, "retiring released connection");
                connection.close();
            }
        }
        Ok(())
    }

    /// Close every connection and stop accepting requests.
    ///
    /// Queued requests receive [`Error::PoolClosed`].
    pub fn close(&self) {
        let (waiters, live) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.available.clear();
            let waiters: Vec<_> = state.waiters.drain(..).collect();
            let live: Vec<_> = state.live.values().map(|slot| slot.connection.clone()).collect();
            (waiters, live)
        };

        if !waiters.is_empty() {
            warn!(
                endpoint = %self.inner.endpoint,
                waiters = waiters.len(),
                "closing pool with requests still waiting"
            );
        }
        for waiter in waiters {
            let Waiter { context, handler } = waiter;
            if let Err(e) = self
                .inner
                .dispatcher
                .post(context, move || handler(Err(Error::PoolClosed)))
            {
                debug!(context = %context, error = %e, "could not notify waiter of pool close");
            }
        }
        for connection in live {
            connection.close();
        }
        debug!(endpoint = %self.inner.endpoint, "pool closed");
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn hand_off(&self, connection: Connection, waiter: Waiter) {
        let Waiter { context, handler } = waiter;
        connection.repin(context);
        self.inner.reused.fetch_add(1, Ordering::Relaxed);
        trace!(connection = connection.id(), context = %context, "connection handed off");

        let retained = connection.clone();
        if let Err(e) = self
            .inner
            .dispatcher
            .post(context, move || handler(Ok(connection)))
        {
            debug!(context = %context, error = %e, "requester gone, recycling connection");
            if let Err(e) = self.check_in(retained, None) {
                debug!(error = %e, "recycled connection could not be released");
            }
        }
    }

    fn connect(&self, waiter: Waiter) {
        let Waiter { context, handler } = waiter;
        let (connection, driver) = Connection::open(
            self.inner.dispatcher.clone(),
            context,
            self.inner.endpoint.clone(),
            self.inner.config.keep_alive,
        );
        let id = connection.id();

        let pool = Arc::downgrade(&self.inner);
        connection.set_close_hook(Box::new(move |id| {
            if let Some(inner) = Weak::upgrade(&pool) {
                ConnectionPool { inner }.connection_closed(id);
            }
        }));
        self.inner.state.lock().live.insert(
            id,
            Slot {
                connection: connection.clone(),
                lease: Lease::Held(context),
            },
        );

        let this = self.clone();
        let spawned = self.inner.dispatcher.spawn_on(context, move || async move {
            let endpoint = this.inner.endpoint.clone();
            match this.inner.transport.connect(&endpoint).await {
                Ok(stream) => {
                    this.inner.created.fetch_add(1, Ordering::Relaxed);
                    debug!(connection = id, endpoint = %endpoint, "connection established");
                    if this.is_closed() {
                        handler(Err(Error::PoolClosed));
                    } else {
                        handler(Ok(connection));
                    }
                    driver.run(stream).await;
                }
                Err(e) => {
                    let error = Error::Admission(format!("connect to {} failed: {}", endpoint, e));
                    this.connect_failed(&connection, error, Some(handler));
                }
            }
        });

        if let Err(e) = spawned {
            // The requester's handler went down with the rejected task
            let connection = self
                .inner
                .state
                .lock()
                .live
                .get(&id)
                .map(|slot| slot.connection.clone());
            if let Some(connection) = connection {
                let error = Error::Admission(format!("cannot open connection on {}: {}", context, e));
                self.connect_failed(&connection, error, None);
            }
        }
    }

    /// Undo the accounting for a connect attempt that never produced a
    /// connection. Waiters are not failed; the oldest one gets the freed
    /// slot.
    fn connect_failed(&self, connection: &Connection, error: Error, handler: Option<ConnectHandler>) {
        drop(connection.abort());
        let next = {
            let mut state = self.inner.state.lock();
            if state.live.remove(&connection.id()).is_some() {
                state.active = state.active.saturating_sub(1);
            }
            state.next_waiter(self.inner.config.max_size)
        };
        self.inner.failed.fetch_add(1, Ordering::Relaxed);

        self.report(&error);
        if let Some(handler) = handler {
            handler(Err(error));
        }
        if let Some(waiter) = next {
            self.connect(waiter);
        }
    }

    fn report(&self, error: &Error) {
        let handler = self.inner.exception_handler.lock().clone();
        match handler {
            Some(handler) => handler(error),
            None => error!(endpoint = %self.inner.endpoint, error = %error, "connection pool error"),
        }
    }

    fn connection_closed(&self, id: ConnectionId) {
        let next = {
            let mut state = self.inner.state.lock();
            if state.live.remove(&id).is_none() {
                return;
            }
            state.available.retain(|c| c.id() != id);
            state.active = state.active.saturating_sub(1);
            state.next_waiter(self.inner.config.max_size)
        };

        trace!(connection = id, endpoint = %self.inner.endpoint, "pool slot freed");
        if let Some(waiter) = next {
            self.connect(waiter);
        }
    }
}

impl PoolState {
    fn lease(&mut self, id: ConnectionId, lease: Lease) {
        if let Some(slot) = self.live.get_mut(&id) {
            slot.lease = lease;
        }
    }

    /// Claim a free slot for the oldest waiter, if both exist.
    fn next_waiter(&mut self, max_size: usize) -> Option<Waiter> {
        if self.closed || self.active >= max_size {
            return None;
        }
        let waiter = self.waiters.pop_front()?;
        self.active += 1;
        Some(waiter)
    }
}
