//! # Strand Net
//!
//! TCP clients and servers for the strand runtime.
//!
//! Every callback a connection produces (data, drain, end, errors, close)
//! runs on the connection's owning execution context. Clients draw
//! connections from a bounded per-endpoint pool and always receive them on
//! the context that asked. Servers place each accepted connection on its own
//! context, spread across workers.
//!
//! ## Features
//!
//! - **Bounded pools**: FIFO waiters, keep-alive reuse, connect-failure reporting
//! - **Flow control**: write queue limits with drain notifications, pause/resume
//! - **TLS**: rustls client and server configs from PEM files
//! - **Pluggable transports**: the pool opens streams through [`Transport`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use strand_core::{Runtime, RuntimeConfig};
//! use strand_net::NetServer;
//!
//! # fn main() -> strand_core::Result<()> {
//! let runtime = Runtime::new(RuntimeConfig::new().workers(4))?;
//! let rt = runtime.clone();
//!
//! runtime.execute(move || {
//!     let server = NetServer::new(&rt).expect("inside a context");
//!     let _ = server.connect_handler(|connection| {
//!         let echo = connection.clone();
//!         connection.data_handler(move |chunk| {
//!             let _ = echo.write(chunk);
//!         });
//!     });
//!     let _ = server.listen("127.0.0.1:7000");
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod pool;
pub mod server;
pub mod tls;
pub mod transport;

pub use client::NetClient;
pub use config::{ClientConfig, ClientConfigBuilder};
pub use connection::{Connection, ConnectionId, ConnectionState, DEFAULT_WRITE_QUEUE_MAX};
pub use endpoint::Endpoint;
pub use pool::{ConnectHandler, ConnectionPool, PoolConfig, PoolStats};
pub use server::NetServer;
pub use tls::{ClientAuth, TlsConfig};
pub use transport::{AsyncStream, BoxedStream, TcpTransport, Transport};
