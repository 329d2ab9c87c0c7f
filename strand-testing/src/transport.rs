//! In-memory transport.
//!
//! [`MockTransport`] hands the pool one end of a `tokio::io::duplex` pipe
//! and keeps the other end, the peer, for the test to read and write.

use futures_util::FutureExt;
use futures_util::future::LocalBoxFuture;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use strand_net::{BoxedStream, Endpoint, Transport};
use tokio::io::DuplexStream;
use tracing::trace;

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Default)]
struct MockState {
    attempts: AtomicUsize,
    failures_left: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    endpoints: Mutex<Vec<Endpoint>>,
    peers: Mutex<Vec<Option<DuplexStream>>>,
}

/// Transport whose connections are in-memory pipes.
///
/// Peer ends stay alive inside the transport until taken, so connections do
/// not see end-of-stream on their own.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("attempts", &self.connect_count())
            .field("peers", &self.peer_count())
            .finish()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait `delay` before completing each connect.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.state.delay.lock() = Some(delay);
        self
    }

    /// Refuse the next `n` connect attempts.
    pub fn fail_next(&self, n: usize) {
        self.state.failures_left.store(n, Ordering::SeqCst);
    }

    /// Connect attempts, successful or not.
    pub fn connect_count(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Successful connects.
    pub fn peer_count(&self) -> usize {
        self.state.peers.lock().len()
    }

    /// Endpoints passed to `connect`, in call order.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.state.endpoints.lock().clone()
    }

    /// Take the peer end of the `index`th successful connection.
    pub fn take_peer(&self, index: usize) -> Option<DuplexStream> {
        self.state.peers.lock().get_mut(index).and_then(Option::take)
    }

    fn consume_failure(&self) -> bool {
        self.state
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Transport for MockTransport {
    fn connect(&self, endpoint: &Endpoint) -> LocalBoxFuture<'static, io::Result<BoxedStream>> {
        let this = self.clone();
        let endpoint = endpoint.clone();

        async move {
            this.state.attempts.fetch_add(1, Ordering::SeqCst);
            this.state.endpoints.lock().push(endpoint.clone());

            let delay = *this.state.delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if this.consume_failure() {
                trace!(endpoint = %endpoint, "mock connect refused");
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("mock refused {}", endpoint),
                ));
            }

            let (local, peer) = tokio::io::duplex(PIPE_CAPACITY);
            this.state.peers.lock().push(Some(peer));
            trace!(endpoint = %endpoint, "mock connected");
            Ok(Box::new(local) as BoxedStream)
        }
        .boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_connect_yields_connected_pipe() {
        let transport = MockTransport::new();
        let mut stream = transport.connect(&Endpoint::new("mock", 1)).await.unwrap();
        let mut peer = transport.take_peer(0).unwrap();

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert!(transport.take_peer(0).is_none());
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let transport = MockTransport::new();
        transport.fail_next(2);
        let endpoint = Endpoint::new("mock", 1);

        assert!(transport.connect(&endpoint).await.is_err());
        assert!(transport.connect(&endpoint).await.is_err());
        assert!(transport.connect(&endpoint).await.is_ok());
        assert_eq!(transport.connect_count(), 3);
        assert_eq!(transport.peer_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_is_applied() {
        let transport = MockTransport::new().with_delay(Duration::from_secs(30));
        let started = tokio::time::Instant::now();
        transport.connect(&Endpoint::new("mock", 1)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(30));
    }
}
