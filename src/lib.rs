// Strand - context-affine execution for Rust
//
// Long-lived execution contexts pinned to worker threads, typed actor
// mailboxes, and TCP clients and servers whose callbacks always run on the
// context that owns them.

// Re-export core functionality
pub use strand_core::*;

// Byte buffers used by connection handlers
pub use bytes::Bytes;

#[cfg(feature = "net")]
pub use strand_net;

#[cfg(feature = "net")]
pub use strand_net::{
    ClientAuth, ClientConfig, Connection, ConnectionPool, ConnectionState, Endpoint, NetClient,
    NetServer, PoolConfig, PoolStats, TlsConfig, TcpTransport, Transport,
};

#[cfg(feature = "testing")]
pub use strand_testing;

pub mod prelude {
    pub use crate::{
        Bytes,
        ContextId,
        Dispatcher,
        Error,
        HandlerId,
        Mailbox,
        Result,
        Runtime,
        RuntimeConfig,
        current_context,
    };

    pub use crate::logging::{LogConfig, LogFormat, LogLevel};

    #[cfg(feature = "net")]
    pub use crate::{ClientConfig, Connection, Endpoint, NetClient, NetServer, TlsConfig};
}
