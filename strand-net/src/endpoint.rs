//! Remote endpoint descriptors.

use std::fmt;
use std::net::SocketAddr;

/// Address of a remote peer plus whether the link is TLS.
///
/// One connection pool serves exactly one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
    tls: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
        }
    }

    /// Endpoint describing an accepted peer.
    pub fn from_peer(addr: SocketAddr, tls: bool) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
            tls,
        }
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[inline]
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// `host:port`, with IPv6 hosts bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "tls" } else { "tcp" };
        write!(f, "{}://{}", scheme, self.authority())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Endpoint::new("localhost", 80).to_string(), "tcp://localhost:80");
        assert_eq!(
            Endpoint::new("example.com", 443).with_tls(true).to_string(),
            "tls://example.com:443"
        );
    }

    #[test]
    fn test_ipv6_authority() {
        let addr: SocketAddr = "[::1]:8080".parse().unwrap();
        let endpoint = Endpoint::from_peer(addr, false);
        assert_eq!(endpoint.host(), "::1");
        assert_eq!(endpoint.authority(), "[::1]:8080");
    }

    #[test]
    fn test_equality_includes_tls() {
        let plain = Endpoint::new("db", 5432);
        assert_ne!(plain, plain.clone().with_tls(true));
        assert_eq!(plain, Endpoint::new("db", 5432));
    }
}
