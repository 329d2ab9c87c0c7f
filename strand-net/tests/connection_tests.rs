//! Connection lifecycle and flow-control tests over in-memory pipes.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;
use strand_core::{ContextId, Error, current_context};
use strand_net::{Connection, ConnectionPool, ConnectionState, Endpoint, PoolConfig};
use strand_testing::{ContextProbe, DEFAULT_TIMEOUT, Latch, MockTransport, TestRuntime, eventually};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

struct Harness {
    runtime: TestRuntime,
    _pool: ConnectionPool,
    context: ContextId,
    connection: Connection,
    peer: DuplexStream,
}

fn connected() -> Harness {
    strand_testing::init_test_logging();
    let runtime = TestRuntime::new(2);
    let transport = MockTransport::new();
    let pool = ConnectionPool::new(
        runtime.dispatcher().clone(),
        Endpoint::new("mock", 5000),
        Arc::new(transport.clone()),
        PoolConfig::default(),
    )
    .unwrap();

    let context = runtime.create_context();
    let (tx, rx) = mpsc::channel();
    let acquiring = pool.clone();
    runtime
        .run_in_context(context, move || {
            acquiring.acquire(move |result| {
                let _ = tx.send(result);
            })
        })
        .unwrap();
    let connection = rx.recv_timeout(DEFAULT_TIMEOUT).unwrap().unwrap();
    let peer = transport.take_peer(0).unwrap();

    Harness {
        runtime,
        _pool: pool,
        context,
        connection,
        peer,
    }
}

#[test]
fn test_data_is_delivered_on_owner_context() {
    let mut h = connected();
    let probe = ContextProbe::new();
    let received = Arc::new(Mutex::new(Vec::new()));
    let latch = Latch::new(1);
    {
        let probe = probe.clone();
        let received = received.clone();
        let latch = latch.clone();
        h.connection.data_handler(move |chunk| {
            probe.record();
            received.lock().extend_from_slice(&chunk);
            if received.lock().len() >= 11 {
                latch.count_down();
            }
        });
    }

    tokio_test::block_on(async {
        h.peer.write_all(b"hello ").await.unwrap();
        h.peer.write_all(b"world").await.unwrap();
    });

    assert!(latch.wait(DEFAULT_TIMEOUT));
    assert_eq!(&received.lock()[..], b"hello world");
    assert!(probe.all_on(h.context));
    assert_eq!(h.connection.state(), ConnectionState::Active);
}

#[test]
fn test_writes_reach_peer_in_order() {
    let mut h = connected();
    h.connection.write(&b"one,"[..]).unwrap();
    h.connection.write(&b"two,"[..]).unwrap();
    h.connection.write(&b"three"[..]).unwrap();

    let mut buf = [0u8; 13];
    tokio_test::block_on(h.peer.read_exact(&mut buf)).unwrap();
    assert_eq!(&buf, b"one,two,three");
}

#[test]
fn test_write_completion_runs_on_owner_context() {
    let mut h = connected();
    let (tx, rx) = mpsc::channel();
    h.connection
        .write_with(&b"ack"[..], move || {
            let _ = tx.send(current_context());
        })
        .unwrap();

    let mut buf = [0u8; 3];
    tokio_test::block_on(h.peer.read_exact(&mut buf)).unwrap();
    assert_eq!(rx.recv_timeout(DEFAULT_TIMEOUT).unwrap(), Some(h.context));
    assert!(eventually(DEFAULT_TIMEOUT, || h.connection.queued_bytes() == 0));
}

#[test]
fn test_close_flushes_then_notifies_owner() {
    let mut h = connected();
    let (tx, rx) = mpsc::channel();
    h.connection.closed_handler(move || {
        let _ = tx.send(current_context());
    });

    h.connection.write(&b"bye"[..]).unwrap();
    h.connection.close();
    assert!(matches!(
        h.connection.write(&b"late"[..]),
        Err(Error::ConnectionClosed)
    ));

    let mut received = Vec::new();
    tokio_test::block_on(h.peer.read_to_end(&mut received)).unwrap();
    assert_eq!(received, b"bye");

    assert_eq!(rx.recv_timeout(DEFAULT_TIMEOUT).unwrap(), Some(h.context));
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(h.connection.state(), ConnectionState::Closed);
}

#[test]
fn test_peer_eof_fires_end_then_closed() {
    let h = connected();
    let events = Arc::new(Mutex::new(Vec::new()));
    let latch = Latch::new(1);
    {
        let events = events.clone();
        h.connection.end_handler(move || events.lock().push("end"));
    }
    {
        let events = events.clone();
        let latch = latch.clone();
        h.connection.closed_handler(move || {
            events.lock().push("closed");
            latch.count_down();
        });
    }

    drop(h.peer);
    assert!(latch.wait(DEFAULT_TIMEOUT));
    assert_eq!(*events.lock(), vec!["end", "closed"]);
    assert!(h.connection.state().is_closed());
    drop(h.runtime);
}

#[test]
fn test_drain_fires_after_full_queue_empties() {
    let mut h = connected();
    let probe = ContextProbe::new();
    let latch = Latch::new(1);
    {
        let probe = probe.clone();
        let latch = latch.clone();
        h.connection.drain_handler(move || {
            probe.record();
            latch.count_down();
        });
    }

    h.connection.set_write_queue_max_size(4);
    h.connection.write(&b"12345678"[..]).unwrap();

    let mut buf = [0u8; 8];
    tokio_test::block_on(h.peer.read_exact(&mut buf)).unwrap();
    assert!(latch.wait(DEFAULT_TIMEOUT));
    assert!(probe.all_on(h.context));
    assert!(!h.connection.write_queue_full());
}

#[test]
fn test_drain_not_fired_below_limit() {
    let mut h = connected();
    let fired = Latch::new(1);
    {
        let fired = fired.clone();
        h.connection.drain_handler(move || fired.count_down());
    }

    h.connection.write(&b"small"[..]).unwrap();
    let mut buf = [0u8; 5];
    tokio_test::block_on(h.peer.read_exact(&mut buf)).unwrap();
    assert!(!fired.wait(Duration::from_millis(50)));
}

#[test]
fn test_pause_holds_back_data_until_resume() {
    let mut h = connected();
    let latch = Latch::new(1);
    {
        let latch = latch.clone();
        h.connection.data_handler(move |_| latch.count_down());
    }

    h.connection.pause();
    std::thread::sleep(Duration::from_millis(50));
    tokio_test::block_on(h.peer.write_all(b"held")).unwrap();
    assert!(!latch.wait(Duration::from_millis(100)));

    h.connection.resume();
    assert!(latch.wait(DEFAULT_TIMEOUT));
}
