//! Byte-stream transports.
//!
//! The pool never opens sockets itself; it asks a [`Transport`] for a stream
//! to an [`Endpoint`]. The returned future runs on a worker thread, so the
//! stream does not have to be `Send`.

use crate::endpoint::Endpoint;
use crate::tls::TlsConfig;
use futures_util::FutureExt;
use futures_util::future::LocalBoxFuture;
use rustls::pki_types::ServerName;
use std::io;
use std::time::Duration;
use strand_core::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::trace;

/// A duplex byte stream usable by a connection driver.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + 'static {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens streams to remote endpoints.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self, endpoint: &Endpoint) -> LocalBoxFuture<'static, io::Result<BoxedStream>>;
}

/// Plain TCP with optional TLS.
#[derive(Clone)]
pub struct TcpTransport {
    tls: Option<TlsConnector>,
    connect_timeout: Option<Duration>,
    nodelay: bool,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("tls", &self.tls.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .field("nodelay", &self.nodelay)
            .finish()
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            tls: None,
            connect_timeout: None,
            nodelay: true,
        }
    }

    /// Use `config` for endpoints marked TLS.
    pub fn with_tls(mut self, config: &TlsConfig) -> Result<Self> {
        self.tls = Some(TlsConnector::from(config.client_config()?));
        Ok(self)
    }

    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Transport for TcpTransport {
    fn connect(&self, endpoint: &Endpoint) -> LocalBoxFuture<'static, io::Result<BoxedStream>> {
        let endpoint = endpoint.clone();
        let this = self.clone();

        async move {
            let connect = TcpStream::connect((endpoint.host(), endpoint.port()));
            let stream = match this.connect_timeout {
                Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {} timed out after {:?}", endpoint, limit),
                    )
                })??,
                None => connect.await?,
            };
            stream.set_nodelay(this.nodelay)?;
            trace!(endpoint = %endpoint, "tcp connected");

            if !endpoint.is_tls() {
                return Ok(Box::new(stream) as BoxedStream);
            }

            let connector = this.tls.ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} requires TLS but no TLS configuration was given", endpoint),
                )
            })?;
            let name = ServerName::try_from(endpoint.host().to_string()).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid server name {}: {}", endpoint.host(), e),
                )
            })?;
            let stream = connector.connect(name, stream).await?;
            trace!(endpoint = %endpoint, "tls handshake complete");
            Ok(Box::new(stream) as BoxedStream)
        }
        .boxed_local()
    }
}
