//! Connections and their I/O driver.
//!
//! A [`Connection`] is a cloneable handle to one live byte stream. The
//! stream itself is owned by a driver task on the worker that opened it;
//! handles talk to the driver through a write queue. Every user callback
//! (data, drain, exception, end, closed, write completion) is dispatched to
//! the connection's owning context, which a pool re-assigns on each
//! hand-off.
//!
//! ```text
//!  Connecting ──► Active ──► Closing ──► Closed
//!      │                                   ▲
//!      └──────────── connect failed ───────┘
//! ```

use crate::endpoint::Endpoint;
use crate::transport::BoxedStream;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use strand_core::{ContextId, Dispatcher, Error, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

/// Default write-queue size at which [`Connection::write_queue_full`]
/// reports true.
pub const DEFAULT_WRITE_QUEUE_MAX: usize = 64 * 1024;

const READ_BUFFER_SIZE: usize = 8 * 1024;

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Connection State
// ============================================================================

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport connect in progress
    Connecting,
    /// Stream established and usable
    Active,
    /// Close requested, queued writes still flushing
    Closing,
    /// Final; reads and writes fail
    Closed,
}

impl ConnectionState {
    /// Writes are accepted in this state.
    #[inline]
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Active)
    }

    #[inline]
    pub fn is_closed(self) -> bool {
        self == ConnectionState::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Active => "active",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Handles
// ============================================================================

type DataHandler = Arc<dyn Fn(Bytes) + Send + Sync + 'static>;
type ErrorHandler = Arc<dyn Fn(Error) + Send + Sync + 'static>;
type Callback = Arc<dyn Fn() + Send + Sync + 'static>;

type WriteDone = Box<dyn FnOnce() + Send + 'static>;

/// Called once with the connection id after the connection reaches
/// [`ConnectionState::Closed`].
pub(crate) type CloseHook = Box<dyn FnOnce(ConnectionId) + Send + 'static>;

#[derive(Default)]
struct Handlers {
    data: Option<DataHandler>,
    drain: Option<Callback>,
    exception: Option<ErrorHandler>,
    end: Option<Callback>,
    closed: Option<Callback>,
}

enum Outbound {
    Data {
        bytes: Bytes,
        done: Option<(ContextId, WriteDone)>,
    },
    Close,
}

struct Inner {
    id: ConnectionId,
    endpoint: Endpoint,
    keep_alive: bool,
    dispatcher: Dispatcher,
    owner: Mutex<ContextId>,
    // Bumped on every re-pin and handler reset; events stamped with an
    // older value are dropped at delivery.
    epoch: AtomicU64,
    state: Mutex<ConnectionState>,
    handlers: Mutex<Handlers>,
    outbound: mpsc::UnboundedSender<Outbound>,
    paused: watch::Sender<bool>,
    queued_bytes: AtomicUsize,
    write_queue_max: AtomicUsize,
    drain_pending: AtomicBool,
    close_hook: Mutex<Option<CloseHook>>,
}

/// Handle to one transport connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("owner", &self.owner())
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

impl Connection {
    /// Create a connection in the `Connecting` state and the driver that
    /// will own its stream.
    pub(crate) fn open(
        dispatcher: Dispatcher,
        owner: ContextId,
        endpoint: Endpoint,
        keep_alive: bool,
    ) -> (Connection, ConnectionDriver) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (paused_tx, paused_rx) = watch::channel(false);

        let connection = Connection {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                endpoint,
                keep_alive,
                dispatcher,
                owner: Mutex::new(owner),
                epoch: AtomicU64::new(0),
                state: Mutex::new(ConnectionState::Connecting),
                handlers: Mutex::new(Handlers::default()),
                outbound: outbound_tx,
                paused: paused_tx,
                queued_bytes: AtomicUsize::new(0),
                write_queue_max: AtomicUsize::new(DEFAULT_WRITE_QUEUE_MAX),
                drain_pending: AtomicBool::new(false),
                close_hook: Mutex::new(None),
            }),
        };
        let driver = ConnectionDriver {
            connection: connection.clone(),
            outbound: outbound_rx,
            paused: paused_rx,
        };
        (connection, driver)
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    #[inline]
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Whether a pool keeps this connection for reuse after release.
    #[inline]
    pub fn keep_alive(&self) -> bool {
        self.inner.keep_alive
    }

    /// Context that receives this connection's callbacks.
    pub fn owner(&self) -> ContextId {
        *self.inner.owner.lock()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    pub(crate) fn repin(&self, owner: ContextId) {
        let previous = {
            let mut current = self.inner.owner.lock();
            self.inner.epoch.fetch_add(1, Ordering::AcqRel);
            std::mem::replace(&mut *current, owner)
        };
        if previous != owner {
            trace!(connection = self.id(), from = %previous, to = %owner, "connection re-pinned");
        }
    }

    pub(crate) fn set_close_hook(&self, hook: CloseHook) {
        *self.inner.close_hook.lock() = Some(hook);
    }

    // ------------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------------

    /// Called with each chunk read from the peer.
    pub fn data_handler<F>(&self, handler: F) -> &Self
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        self.inner.handlers.lock().data = Some(Arc::new(handler));
        self
    }

    /// Called when a full write queue has drained to half its maximum.
    pub fn drain_handler<F>(&self, handler: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.handlers.lock().drain = Some(Arc::new(handler));
        self
    }

    /// Called when a read or write fails. Without a handler, errors are logged.
    pub fn exception_handler<F>(&self, handler: F) -> &Self
    where
        F: Fn(Error) + Send + Sync + 'static,
    {
        self.inner.handlers.lock().exception = Some(Arc::new(handler));
        self
    }

    /// Called when the peer finishes sending.
    pub fn end_handler<F>(&self, handler: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.handlers.lock().end = Some(Arc::new(handler));
        self
    }

    /// Called once when the connection reaches `Closed`.
    pub fn closed_handler<F>(&self, handler: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.handlers.lock().closed = Some(Arc::new(handler));
        self
    }

    pub(crate) fn clear_handlers(&self) {
        let previous = {
            let mut handlers = self.inner.handlers.lock();
            self.inner.epoch.fetch_add(1, Ordering::AcqRel);
            std::mem::take(&mut *handlers)
        };
        drop(previous);
    }

    /// Owner and epoch, read together.
    fn stamp(&self) -> (ContextId, u64) {
        let owner = self.inner.owner.lock();
        (*owner, self.inner.epoch.load(Ordering::Acquire))
    }

    fn is_stamped(&self, stamp: (ContextId, u64)) -> bool {
        self.stamp() == stamp
    }

    // ------------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------------

    /// Queue `data` for writing.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        self.enqueue(data.into(), None)
    }

    /// Queue `data` and call `done` on the owning context once it has been
    /// handed to the transport.
    pub fn write_with<F>(&self, data: impl Into<Bytes>, done: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(data.into(), Some(Box::new(done)))
    }

    fn enqueue(&self, bytes: Bytes, done: Option<WriteDone>) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        // Completion goes to whoever wrote, even if the connection has
        // been handed on by the time the bytes are flushed.
        let done = done.map(|done| (self.owner(), done));

        let len = bytes.len();
        let queued = self.inner.queued_bytes.fetch_add(len, Ordering::AcqRel) + len;
        if queued >= self.write_queue_max() {
            self.inner.drain_pending.store(true, Ordering::Release);
        }

        self.inner
            .outbound
            .send(Outbound::Data { bytes, done })
            .map_err(|_| {
                self.inner.queued_bytes.fetch_sub(len, Ordering::AcqRel);
                Error::ConnectionClosed
            })
    }

    pub fn set_write_queue_max_size(&self, max: usize) {
        self.inner.write_queue_max.store(max.max(1), Ordering::Release);
    }

    #[inline]
    pub fn write_queue_max(&self) -> usize {
        self.inner.write_queue_max.load(Ordering::Acquire)
    }

    /// Bytes accepted by `write` but not yet handed to the transport.
    #[inline]
    pub fn queued_bytes(&self) -> usize {
        self.inner.queued_bytes.load(Ordering::Acquire)
    }

    /// True once the write queue has reached its maximum size.
    #[inline]
    pub fn write_queue_full(&self) -> bool {
        self.queued_bytes() >= self.write_queue_max()
    }

    // ------------------------------------------------------------------------
    // Flow control and closing
    // ------------------------------------------------------------------------

    /// Stop reading from the peer until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.inner.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.inner.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    /// Flush queued writes, then close. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if !state.is_open() {
                return;
            }
            *state = ConnectionState::Closing;
        }
        trace!(connection = self.id(), "close requested");
        let _ = self.inner.outbound.send(Outbound::Close);
    }

    // ------------------------------------------------------------------------
    // Driver side
    // ------------------------------------------------------------------------

    fn activate(&self) {
        let mut state = self.inner.state.lock();
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Active;
        }
    }

    /// Run `work` on the owning context, unless the connection is re-pinned
    /// or its handlers reset before it gets there. Returns false if the
    /// context is gone.
    fn dispatch<F>(&self, event: &'static str, work: F) -> bool
    where
        F: FnOnce(&Connection) + Send + 'static,
    {
        let connection = self.clone();
        let stamp = self.stamp();
        self.run_on_context(stamp.0, event, move || {
            if connection.is_stamped(stamp) {
                work(&connection);
            } else {
                trace!(connection = connection.id(), event, "stale connection event dropped");
            }
        })
    }

    fn run_on_context<F>(&self, context: ContextId, event: &'static str, work: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.inner.dispatcher.run_on(context, work) {
            Ok(()) => true,
            Err(e) => {
                debug!(connection = self.id(), event, error = %e, "connection event dropped");
                false
            }
        }
    }

    fn emit_data(&self, chunk: Bytes) {
        self.dispatch("data", move |conn| {
            let handler = conn.inner.handlers.lock().data.clone();
            if let Some(handler) = handler {
                handler(chunk);
            }
        });
    }

    fn emit_drain(&self) {
        self.dispatch("drain", |conn| {
            let handler = conn.inner.handlers.lock().drain.clone();
            if let Some(handler) = handler {
                handler();
            }
        });
    }

    fn emit_end(&self) {
        self.dispatch("end", |conn| {
            let handler = conn.inner.handlers.lock().end.clone();
            if let Some(handler) = handler {
                handler();
            }
        });
    }

    fn emit_exception(&self, error: Error) {
        self.dispatch("exception", move |conn| {
            let handler = conn.inner.handlers.lock().exception.clone();
            match handler {
                Some(handler) => handler(error),
                None => warn!(connection = conn.id(), error = %error, "unhandled connection error"),
            }
        });
    }

    fn wrote(&self, len: usize) {
        let remaining = self
            .inner
            .queued_bytes
            .fetch_sub(len, Ordering::AcqRel)
            .saturating_sub(len);
        if remaining <= self.write_queue_max() / 2
            && self.inner.drain_pending.swap(false, Ordering::AcqRel)
        {
            self.emit_drain();
        }
    }

    /// Move to `Closed` without ever having been active. Handlers are
    /// dropped unfired; the close hook is returned for the caller to run
    /// or discard.
    pub(crate) fn abort(&self) -> Option<CloseHook> {
        *self.inner.state.lock() = ConnectionState::Closed;
        self.clear_handlers();
        self.inner.close_hook.lock().take()
    }

    /// Take the handlers on the owning context and fire the closed handler.
    /// Handlers are taken there so events queued before the close still
    /// find them. If the connection was re-pinned in the meantime, the
    /// notice follows it to the new owner.
    fn notify_closed(&self) -> bool {
        let connection = self.clone();
        let stamp = self.stamp();
        self.run_on_context(stamp.0, "closed", move || {
            if !connection.is_stamped(stamp) {
                if !connection.notify_closed() {
                    connection.clear_handlers();
                }
                return;
            }
            let handlers = std::mem::take(&mut *connection.inner.handlers.lock());
            if let Some(closed) = handlers.closed {
                closed();
            }
        })
    }

    /// Move to `Closed`, fire the closed handler and run the close hook.
    /// Only the first call has any effect.
    fn finish_close(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }
        self.inner.queued_bytes.store(0, Ordering::Release);
        debug!(connection = self.id(), endpoint = %self.inner.endpoint, "connection closed");

        if !self.notify_closed() {
            self.clear_handlers();
        }

        let hook = self.inner.close_hook.lock().take();
        if let Some(hook) = hook {
            hook(self.id());
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Owns the stream of one connection; runs as a local task on a worker.
pub(crate) struct ConnectionDriver {
    connection: Connection,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    paused: watch::Receiver<bool>,
}

impl ConnectionDriver {
    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Pump data between `stream` and the connection until either side
    /// closes, then finish the close.
    pub(crate) async fn run(self, stream: BoxedStream) {
        let ConnectionDriver {
            connection,
            mut outbound,
            mut paused,
        } = self;

        connection.activate();
        trace!(connection = connection.id(), "driver started");

        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

        let failure = loop {
            let reading = !*paused.borrow();

            tokio::select! {
                op = outbound.recv() => match op {
                    Some(Outbound::Data { bytes, done }) => {
                        let len = bytes.len();
                        let result = match writer.write_all(&bytes).await {
                            Ok(()) => writer.flush().await,
                            Err(e) => Err(e),
                        };
                        connection.wrote(len);
                        if let Err(e) = result {
                            break Some(Error::Io(e));
                        }
                        if let Some((writer, done)) = done {
                            connection.run_on_context(writer, "write", done);
                        }
                    }
                    Some(Outbound::Close) | None => break None,
                },
                read = reader.read_buf(&mut buffer), if reading => match read {
                    Ok(0) => {
                        connection.emit_end();
                        break None;
                    }
                    Ok(_) => {
                        connection.emit_data(buffer.split().freeze());
                        buffer.reserve(READ_BUFFER_SIZE);
                    }
                    Err(e) => break Some(Error::Io(e)),
                },
                changed = paused.changed() => {
                    if changed.is_err() {
                        break None;
                    }
                }
            }
        };

        if let Some(error) = failure {
            connection.emit_exception(error);
        }
        if let Err(e) = writer.shutdown().await {
            trace!(connection = connection.id(), error = %e, "shutdown after close failed");
        }
        connection.finish_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::{Runtime, RuntimeConfig};

    fn open(runtime: &Runtime) -> (Connection, ConnectionDriver) {
        let context = runtime.create_context();
        Connection::open(
            runtime.dispatcher().clone(),
            context,
            Endpoint::new("localhost", 9),
            true,
        )
    }

    #[test]
    fn test_state_predicates() {
        assert!(ConnectionState::Connecting.is_open());
        assert!(ConnectionState::Active.is_open());
        assert!(!ConnectionState::Closing.is_open());
        assert!(ConnectionState::Closed.is_closed());
        assert_eq!(ConnectionState::Closing.to_string(), "closing");
    }

    #[test]
    fn test_new_connection_is_connecting() {
        let runtime = Runtime::new(RuntimeConfig::new().workers(1)).unwrap();
        let (connection, driver) = open(&runtime);

        assert_eq!(connection.state(), ConnectionState::Connecting);
        assert_eq!(driver.connection(), &connection);
        assert!(connection.keep_alive());
        runtime.shutdown();
    }

    #[test]
    fn test_ids_are_unique() {
        let runtime = Runtime::new(RuntimeConfig::new().workers(1)).unwrap();
        let (a, _da) = open(&runtime);
        let (b, _db) = open(&runtime);
        assert_ne!(a.id(), b.id());
        assert_ne!(a, b);
        runtime.shutdown();
    }

    #[test]
    fn test_write_queue_accounting() {
        let runtime = Runtime::new(RuntimeConfig::new().workers(1)).unwrap();
        let (connection, _driver) = open(&runtime);
        connection.set_write_queue_max_size(10);

        connection.write(&b"hello"[..]).unwrap();
        assert_eq!(connection.queued_bytes(), 5);
        assert!(!connection.write_queue_full());

        connection.write(&b"world"[..]).unwrap();
        assert!(connection.write_queue_full());
        runtime.shutdown();
    }

    #[test]
    fn test_close_is_idempotent_and_rejects_writes() {
        let runtime = Runtime::new(RuntimeConfig::new().workers(1)).unwrap();
        let (connection, _driver) = open(&runtime);

        connection.close();
        connection.close();
        assert_eq!(connection.state(), ConnectionState::Closing);
        assert!(matches!(
            connection.write(&b"late"[..]),
            Err(Error::ConnectionClosed)
        ));
        runtime.shutdown();
    }

    #[test]
    fn test_abort_returns_hook_once() {
        let runtime = Runtime::new(RuntimeConfig::new().workers(1)).unwrap();
        let (connection, _driver) = open(&runtime);
        connection.set_close_hook(Box::new(|_| {}));

        assert!(connection.abort().is_some());
        assert!(connection.abort().is_none());
        assert_eq!(connection.state(), ConnectionState::Closed);
        runtime.shutdown();
    }

    #[test]
    fn test_pause_resume() {
        let runtime = Runtime::new(RuntimeConfig::new().workers(1)).unwrap();
        let (connection, _driver) = open(&runtime);

        assert!(!connection.is_paused());
        connection.pause();
        assert!(connection.is_paused());
        connection.resume();
        assert!(!connection.is_paused());
        runtime.shutdown();
    }
}
