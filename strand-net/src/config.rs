//! Client configuration.

use crate::endpoint::Endpoint;
use crate::pool::PoolConfig;
use crate::tls::TlsConfig;
use std::time::Duration;
use strand_core::{Error, Result};

/// Settings for a [`NetClient`](crate::NetClient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Remote host name or address.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// TLS settings; used when `tls.enabled` is set.
    pub tls: TlsConfig,
    /// Maximum live connections to the endpoint.
    pub max_pool_size: usize,
    /// Reuse released connections.
    pub keep_alive: bool,
    /// Give up on a connect attempt after this long.
    pub connect_timeout: Option<Duration>,
    /// Disable Nagle's algorithm on new sockets.
    pub tcp_nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 80,
            tls: TlsConfig::default(),
            max_pool_size: 1,
            keep_alive: true,
            connect_timeout: Some(Duration::from_secs(10)),
            tcp_nodelay: true,
        }
    }
}

impl ClientConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        self.pool_config().validate()?;
        if self.tls.enabled {
            self.tls.validate_client()?;
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port).with_tls(self.tls.enabled)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new()
            .max_size(self.max_pool_size)
            .keep_alive(self.keep_alive)
    }
}

/// Builder for client configuration.
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.config.tls = tls;
        self
    }

    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.config.max_pool_size = size;
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    /// Wait for the operating system's connect timeout instead.
    pub fn no_connect_timeout(mut self) -> Self {
        self.config.connect_timeout = None;
        self
    }

    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<ClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 80);
        assert_eq!(config.max_pool_size, 1);
        assert!(config.keep_alive);
        assert!(!config.tls.enabled);
        assert_eq!(config.endpoint().to_string(), "tcp://localhost:80");
    }

    #[test]
    fn test_builder() {
        let config = ClientConfig::builder()
            .host("db.internal")
            .port(5432)
            .max_pool_size(8)
            .keep_alive(false)
            .connect_timeout(Duration::from_millis(250))
            .build()
            .unwrap();

        assert_eq!(config.endpoint(), Endpoint::new("db.internal", 5432));
        assert_eq!(config.pool_config(), PoolConfig::new().max_size(8).keep_alive(false));
        assert_eq!(config.connect_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let result = ClientConfig::builder().max_pool_size(0).build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_tls_endpoint() {
        let config = ClientConfig::builder()
            .port(443)
            .tls(TlsConfig::new().enabled(true).trust_all(true))
            .build()
            .unwrap();
        assert!(config.endpoint().is_tls());
    }

    #[test]
    fn test_tls_without_trust_rejected() {
        let result = ClientConfig::builder()
            .tls(TlsConfig::new().enabled(true))
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
