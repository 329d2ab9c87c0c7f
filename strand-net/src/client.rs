//! Pooled network client.
//!
//! A [`NetClient`] owns one [`ConnectionPool`] for its configured endpoint.
//! Connections are requested from inside an execution context and are
//! delivered back to that same context.
//!
//! ```no_run
//! use strand_core::{Runtime, RuntimeConfig};
//! use strand_net::{ClientConfig, NetClient};
//!
//! # fn main() -> strand_core::Result<()> {
//! let runtime = Runtime::new(RuntimeConfig::new().workers(2))?;
//! let config = ClientConfig::builder().host("127.0.0.1").port(6379).build()?;
//! let client = NetClient::new(&runtime, config)?;
//!
//! runtime.execute(move || {
//!     let pooled = client.clone();
//!     let _ = client.connect(move |result| {
//!         if let Ok(connection) = result {
//!             let _ = connection.write(&b"PING\r\n"[..]);
//!             let _ = pooled.release(connection);
//!         }
//!     });
//! })?;
//! # Ok(())
//! # }
//! ```

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::pool::{ConnectionPool, PoolStats};
use crate::transport::{TcpTransport, Transport};
use std::sync::Arc;
use strand_core::{ContextId, Error, Result, Runtime};
use tracing::debug;

/// Client for one remote endpoint.
#[derive(Clone, Debug)]
pub struct NetClient {
    config: Arc<ClientConfig>,
    pool: ConnectionPool,
}

impl NetClient {
    /// Create a client that connects over TCP, with TLS when
    /// `config.tls.enabled` is set.
    pub fn new(runtime: &Runtime, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let mut transport = TcpTransport::new()
            .connect_timeout(config.connect_timeout)
            .nodelay(config.tcp_nodelay);
        if config.tls.enabled {
            transport = transport.with_tls(&config.tls)?;
        }
        Self::with_transport(runtime, config, Arc::new(transport))
    }

    /// Create a client that opens streams through `transport`.
    pub fn with_transport(
        runtime: &Runtime,
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = ConnectionPool::new(
            runtime.dispatcher().clone(),
            config.endpoint(),
            transport,
            config.pool_config(),
        )?;
        debug!(endpoint = %pool.endpoint(), max_pool_size = config.max_pool_size, "client created");

        Ok(Self {
            config: Arc::new(config),
            pool,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Handler for connect failures. The default logs at error level.
    pub fn exception_handler<F>(&self, handler: F) -> &Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.pool.exception_handler(handler);
        self
    }

    /// Get a connection for the current context.
    ///
    /// `handler` runs later on the current context. Fails with
    /// [`Error::UnboundExecution`] when called outside a context.
    pub fn connect<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(Result<Connection>) + Send + 'static,
    {
        self.pool.acquire(handler)
    }

    /// Get a connection on behalf of `context`.
    pub fn connect_on<F>(&self, context: ContextId, handler: F) -> Result<()>
    where
        F: FnOnce(Result<Connection>) + Send + 'static,
    {
        self.pool.acquire_on(context, handler)
    }

    /// Return a connection to the pool, from the context holding it.
    pub fn release(&self, connection: Connection) -> Result<()> {
        self.pool.release(connection)
    }

    /// Close pooled and live connections. Pending requests fail with
    /// [`Error::PoolClosed`].
    pub fn close(&self) {
        self.pool.close();
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}
