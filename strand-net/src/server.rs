//! Context-affine TCP server.
//!
//! A [`NetServer`] belongs to the context that created it: configuration,
//! `listen` and `close` must be called from there. The accept loop also
//! runs on that context. Each accepted connection gets its own context,
//! placed on the next worker in round-robin order. The stream is moved to
//! that worker, the connect handler runs there, and the context is
//! destroyed once the connection closes.

use crate::connection::{Connection, ConnectionDriver, ConnectionId};
use crate::endpoint::Endpoint;
use crate::tls::TlsConfig;
use crate::transport::BoxedStream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use strand_core::{ContextId, Dispatcher, Error, Result, Runtime};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, trace, warn};

/// Pause after a failed `accept` so a persistent error (such as running
/// out of file descriptors) does not spin the worker.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

type ServerConnectHandler = Arc<dyn Fn(Connection) + Send + Sync + 'static>;

struct Listening {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

struct ServerState {
    handler: Option<ServerConnectHandler>,
    tls: Option<TlsConfig>,
    nodelay: bool,
    listening: Option<Listening>,
    closed: bool,
}

struct ServerInner {
    dispatcher: Dispatcher,
    context: ContextId,
    state: Mutex<ServerState>,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
}

/// Settings shared by the accept loop and the per-connection tasks.
#[derive(Clone)]
struct AcceptSettings {
    handler: ServerConnectHandler,
    acceptor: Option<TlsAcceptor>,
    nodelay: bool,
}

/// TCP server whose callbacks run on execution contexts.
#[derive(Clone)]
pub struct NetServer {
    inner: Arc<ServerInner>,
}

impl fmt::Debug for NetServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetServer")
            .field("context", &self.inner.context)
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl NetServer {
    /// Create a server owned by the current context.
    pub fn new(runtime: &Runtime) -> Result<Self> {
        let dispatcher = runtime.dispatcher().clone();
        let context = dispatcher.require_context("server creation")?;

        Ok(Self {
            inner: Arc::new(ServerInner {
                dispatcher,
                context,
                state: Mutex::new(ServerState {
                    handler: None,
                    tls: None,
                    nodelay: true,
                    listening: None,
                    closed: false,
                }),
                connections: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Context that owns this server.
    #[inline]
    pub fn context(&self) -> ContextId {
        self.inner.context
    }

    /// Called on each accepted connection's own context.
    pub fn connect_handler<F>(&self, handler: F) -> Result<&Self>
    where
        F: Fn(Connection) + Send + Sync + 'static,
    {
        self.configure(|state| state.handler = Some(Arc::new(handler)))?;
        Ok(self)
    }

    /// Serve TLS using `config`'s certificate and key.
    pub fn tls(&self, config: TlsConfig) -> Result<&Self> {
        config.validate_server()?;
        self.configure(|state| state.tls = Some(config))?;
        Ok(self)
    }

    pub fn tcp_nodelay(&self, nodelay: bool) -> Result<&Self> {
        self.configure(|state| state.nodelay = nodelay)?;
        Ok(self)
    }

    fn configure(&self, apply: impl FnOnce(&mut ServerState)) -> Result<()> {
        self.inner.dispatcher.assert_affinity(self.inner.context)?;
        let mut state = self.inner.state.lock();
        if state.listening.is_some() || state.closed {
            return Err(Error::Config(
                "server settings cannot change after listen".into(),
            ));
        }
        apply(&mut state);
        Ok(())
    }

    /// Start accepting connections on `addr` and return the bound address.
    ///
    /// Port 0 picks a free port. The server keeps accepting until
    /// [`close`](Self::close), even if every handle is dropped.
    pub fn listen<A: ToSocketAddrs>(&self, addr: A) -> Result<SocketAddr> {
        self.inner.dispatcher.assert_affinity(self.inner.context)?;
        let mut state = self.inner.state.lock();
        if state.listening.is_some() {
            return Err(Error::Config("server is already listening".into()));
        }
        if state.closed {
            return Err(Error::Config("server is closed".into()));
        }
        let handler = state
            .handler
            .clone()
            .ok_or_else(|| Error::Config("connect handler must be set before listen".into()))?;
        let acceptor = match &state.tls {
            Some(tls) => Some(TlsAcceptor::from(tls.server_config()?)),
            None => None,
        };

        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let settings = AcceptSettings {
            handler,
            acceptor,
            nodelay: state.nodelay,
        };
        let server = Arc::clone(&self.inner);
        self.inner.dispatcher.spawn_on(self.inner.context, move || {
            accept_loop(server, listener, shutdown_rx, settings)
        })?;

        state.listening = Some(Listening {
            local_addr,
            shutdown: shutdown_tx,
        });
        info!(
            address = %local_addr,
            context = %self.inner.context,
            tls = state.tls.is_some(),
            "server listening"
        );
        Ok(local_addr)
    }

    /// Stop accepting, close live connections, then run `done` on the
    /// server's context.
    pub fn close<F>(&self, done: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.dispatcher.assert_affinity(self.inner.context)?;
        let listening = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.listening.take()
        };
        if let Some(listening) = listening {
            listening.shutdown.send_replace(true);
            info!(address = %listening.local_addr, "server closing");
        }

        let connections: Vec<_> = self.inner.connections.lock().values().cloned().collect();
        for connection in connections {
            connection.close();
        }
        self.inner.dispatcher.post(self.inner.context, done)
    }

    /// Bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .state
            .lock()
            .listening
            .as_ref()
            .map(|l| l.local_addr)
    }

    pub fn is_listening(&self) -> bool {
        self.inner.state.lock().listening.is_some()
    }

    /// Accepted connections that have not closed yet.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }
}

async fn accept_loop(
    server: Arc<ServerInner>,
    listener: std::net::TcpListener,
    mut shutdown: watch::Receiver<bool>,
    settings: AcceptSettings,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "failed to register listener");
            return;
        }
    };

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => accept(&server, stream, peer, &settings),
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("accept loop stopped");
}

fn accept(inner: &Arc<ServerInner>, stream: TcpStream, peer: SocketAddr, settings: &AcceptSettings) {
    let registry = inner.dispatcher.registry().clone();
    let context = registry.create_round_robin();

    // The stream must register with the reactor of the worker that runs it
    let stream = match stream.into_std() {
        Ok(stream) => stream,
        Err(e) => {
            warn!(peer = %peer, error = %e, "could not detach accepted stream");
            registry.destroy(context);
            return;
        }
    };

    let endpoint = Endpoint::from_peer(peer, settings.acceptor.is_some());
    let (connection, driver) = Connection::open(inner.dispatcher.clone(), context, endpoint, false);
    let id = connection.id();

    let server = Arc::downgrade(inner);
    let dispatcher = inner.dispatcher.clone();
    connection.set_close_hook(Box::new(move |id| {
        if let Some(inner) = server.upgrade() {
            inner.connections.lock().remove(&id);
        }
        let registry = dispatcher.registry().clone();
        if dispatcher
            .post(context, move || {
                registry.destroy(context);
            })
            .is_err()
        {
            dispatcher.registry().destroy(context);
        }
    }));
    inner.connections.lock().insert(id, connection.clone());
    trace!(connection = id, peer = %peer, context = %context, "connection accepted");

    let settings = settings.clone();
    let spawned = inner
        .dispatcher
        .spawn_on(context, move || serve(stream, driver, settings));
    if let Err(e) = spawned {
        warn!(connection = id, error = %e, "could not start accepted connection");
        if let Some(hook) = connection.abort() {
            hook(id);
        }
    }
}

async fn serve(stream: std::net::TcpStream, driver: ConnectionDriver, settings: AcceptSettings) {
    let connection = driver.connection().clone();
    let id = connection.id();

    let stream = match TcpStream::from_std(stream) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(connection = id, error = %e, "could not attach accepted stream");
            abort(&connection);
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(settings.nodelay) {
        trace!(connection = id, error = %e, "set_nodelay failed");
    }

    let stream: BoxedStream = match settings.acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => Box::new(stream),
            Err(e) => {
                warn!(connection = id, error = %e, "tls handshake failed");
                abort(&connection);
                return;
            }
        },
        None => Box::new(stream),
    };

    if connection.is_open() {
        (settings.handler)(connection.clone());
    }
    driver.run(stream).await;
}

fn abort(connection: &Connection) {
    if let Some(hook) = connection.abort() {
        hook(connection.id());
    }
}
