//! End-to-end scenarios across the runtime, mailboxes and networking.

use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::mpsc;
use strand::prelude::*;
use strand_testing::{ContextProbe, DEFAULT_TIMEOUT, Latch, TestRuntime, eventually};

// =============================================================================
// Actor Scenarios
// =============================================================================

#[derive(Debug)]
enum Rally {
    Ping(u32),
    Pong(u32),
}

#[test]
fn test_ping_pong_between_contexts() {
    strand_testing::init_test_logging();
    let runtime = TestRuntime::new(2);
    let mailbox = runtime.mailbox::<Rally>();
    let left = runtime.create_context();
    let right = runtime.create_context();
    let left_probe = ContextProbe::new();
    let right_probe = ContextProbe::new();
    let done = Latch::new(1);

    let right_id = Arc::new(Mutex::new(None::<HandlerId>));

    let left_id = {
        let outbox = mailbox.clone();
        let probe = left_probe.clone();
        let right_id = right_id.clone();
        let done = done.clone();
        mailbox
            .register(left, move |message| {
                probe.record();
                if let Rally::Pong(n) = message {
                    if n == 100 {
                        done.count_down();
                    } else if let Some(id) = *right_id.lock() {
                        outbox.send(id, Rally::Ping(n + 1));
                    }
                }
            })
            .unwrap()
    };

    let id = {
        let outbox = mailbox.clone();
        let probe = right_probe.clone();
        mailbox
            .register(right, move |message| {
                probe.record();
                if let Rally::Ping(n) = message {
                    outbox.send(left_id, Rally::Pong(n));
                }
            })
            .unwrap()
    };
    *right_id.lock() = Some(id);

    mailbox.send(id, Rally::Ping(1));
    assert!(done.wait(DEFAULT_TIMEOUT));
    assert_eq!(left_probe.hits(), 100);
    assert!(left_probe.all_on(left));
    assert!(right_probe.all_on(right));
}

#[test]
fn test_execute_is_the_entry_point() {
    let runtime = Runtime::new(RuntimeConfig::new().workers(1)).unwrap();
    let (tx, rx) = mpsc::channel();

    let context = runtime
        .execute(move || {
            let _ = tx.send(current_context());
        })
        .unwrap();

    assert_eq!(rx.recv_timeout(DEFAULT_TIMEOUT).unwrap(), Some(context));
    runtime.shutdown();
    assert!(matches!(runtime.execute(|| {}), Err(Error::RuntimeShutdown)));
}

// =============================================================================
// Networking Scenarios
// =============================================================================

/// Each accepted connection registers a mailbox handler that writes to its
/// socket; anything a client sends is delivered to every handler.
#[test]
fn test_fanout_server_broadcasts_to_every_connection() {
    strand_testing::init_test_logging();
    let runtime = TestRuntime::new(2);
    let mailbox = runtime.mailbox::<Bytes>();
    let subscribers: Arc<Mutex<Vec<HandlerId>>> = Arc::new(Mutex::new(Vec::new()));
    let rt = runtime.runtime().clone();

    let (_, (server, addr)) = runtime.run_in_new_context({
        let mailbox = mailbox.clone();
        let subscribers = subscribers.clone();
        move || {
            let server = NetServer::new(&rt).unwrap();
            server
                .connect_handler(move |connection| {
                    let writer = connection.clone();
                    let id = mailbox
                        .register_current(move |line: Bytes| {
                            let _ = writer.write(line);
                        })
                        .unwrap();
                    subscribers.lock().push(id);

                    let broadcast = mailbox.clone();
                    let everyone = subscribers.clone();
                    connection.data_handler(move |chunk| {
                        for &id in everyone.lock().iter() {
                            broadcast.send(id, chunk.clone());
                        }
                    });

                    let leaving = mailbox.clone();
                    let everyone = subscribers.clone();
                    connection.closed_handler(move || {
                        leaving.unregister(id);
                        everyone.lock().retain(|other| *other != id);
                    });
                })
                .unwrap();
            let addr = server.listen("127.0.0.1:0").unwrap();
            (server, addr)
        }
    });

    let mut clients: Vec<TcpStream> = (0..3).map(|_| TcpStream::connect(addr).unwrap()).collect();
    assert!(eventually(DEFAULT_TIMEOUT, || subscribers.lock().len() == 3));

    clients[0].write_all(b"hi all\n").unwrap();
    for client in clients.iter_mut() {
        client.set_read_timeout(Some(DEFAULT_TIMEOUT)).unwrap();
        let mut line = [0u8; 7];
        client.read_exact(&mut line).unwrap();
        assert_eq!(&line, b"hi all\n");
    }

    drop(clients.pop());
    assert!(eventually(DEFAULT_TIMEOUT, || subscribers.lock().len() == 2));
    assert!(eventually(DEFAULT_TIMEOUT, || mailbox.len() == 2));
    assert!(eventually(DEFAULT_TIMEOUT, || server.connection_count() == 2));
}

#[test]
fn test_pooled_client_serves_many_contexts_over_one_connection() {
    strand_testing::init_test_logging();
    let runtime = TestRuntime::new(3);
    let rt = runtime.runtime().clone();
    let accepted = Arc::new(Mutex::new(0usize));

    let (_, (_server, addr)) = runtime.run_in_new_context({
        let accepted = accepted.clone();
        move || {
            let server = NetServer::new(&rt).unwrap();
            server
                .connect_handler(move |connection| {
                    *accepted.lock() += 1;
                    let echo = connection.clone();
                    connection.data_handler(move |chunk| {
                        let _ = echo.write(chunk);
                    });
                })
                .unwrap();
            let addr = server.listen("127.0.0.1:0").unwrap();
            (server, addr)
        }
    });

    let config = ClientConfig::builder()
        .host("127.0.0.1")
        .port(addr.port())
        .max_pool_size(1)
        .build()
        .unwrap();
    let client = NetClient::new(runtime.runtime(), config).unwrap();
    let finished = Latch::new(4);

    for _ in 0..4 {
        let client = client.clone();
        let finished = finished.clone();
        let probe = ContextProbe::new();
        runtime.run_in_new_context(move || {
            let releaser = client.clone();
            client
                .connect(move |result| {
                    probe.record();
                    let connection = result.unwrap();
                    let returned = connection.clone();
                    connection.data_handler(move |_| {
                        probe.record();
                        if probe.is_consistent() {
                            finished.count_down();
                        }
                        let _ = releaser.release(returned.clone());
                    });
                    connection.write(&b"x"[..]).unwrap();
                })
                .unwrap()
        });
    }

    assert!(finished.wait(DEFAULT_TIMEOUT));
    assert_eq!(*accepted.lock(), 1);
    assert_eq!(client.stats().created, 1);
    assert_eq!(client.stats().reused, 3);
    client.close();
}
