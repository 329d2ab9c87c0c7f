//! Line fan-out server.
//!
//! Every client that connects receives everything any client sends.
//!
//! ```text
//! cargo run --example fanout -- 127.0.0.1:7000
//! nc 127.0.0.1 7000    # in two or more terminals
//! ```
//!
//! Each accepted connection runs on its own context and registers a mailbox
//! handler that writes to its socket. Incoming data is sent to every
//! registered handler, so each write happens on the owning connection's
//! context. Handlers are unregistered when their connection closes.

use parking_lot::Mutex;
use std::sync::Arc;
use strand::prelude::*;
use tracing::info;

type Subscribers = Arc<Mutex<Vec<HandlerId>>>;

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let _log_guard = LogConfig::from_env()?.init()?;

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7000".to_string());

    let runtime = Runtime::from_env()?;
    let mailbox = runtime.mailbox::<Bytes>();
    let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));

    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let rt = runtime.clone();
    let server_context = runtime.execute(move || {
        let result = start(&rt, addr, mailbox, subscribers);
        let _ = ready_tx.send(result);
    })?;
    let (server, local_addr) = ready_rx.recv()??;
    info!(address = %local_addr, workers = runtime.worker_count(), "fan-out server ready");

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(tokio::signal::ctrl_c())?;

    let (done_tx, done_rx) = std::sync::mpsc::channel();
    runtime.run_on(server_context, move || {
        let closed = server.close(move || {
            let _ = done_tx.send(());
        });
        if let Err(e) = closed {
            tracing::error!(error = %e, "server close failed");
        }
    })?;
    let _ = done_rx.recv();
    runtime.shutdown();
    Ok(())
}

fn start(
    runtime: &Runtime,
    addr: String,
    mailbox: Mailbox<Bytes>,
    subscribers: Subscribers,
) -> Result<(NetServer, std::net::SocketAddr)> {
    let server = NetServer::new(runtime)?;
    server.connect_handler(move |connection| join(&connection, &mailbox, &subscribers))?;
    let local_addr = server.listen(addr.as_str())?;
    Ok((server, local_addr))
}

/// Wire one accepted connection into the fan-out.
fn join(connection: &Connection, mailbox: &Mailbox<Bytes>, subscribers: &Subscribers) {
    let writer = connection.clone();
    let id = match mailbox.register_current(move |line: Bytes| {
        let _ = writer.write(line);
    }) {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(error = %e, "could not subscribe connection");
            connection.close();
            return;
        }
    };
    subscribers.lock().push(id);
    info!(handler_id = %id, peer = %connection.endpoint(), "client joined");

    let broadcast = mailbox.clone();
    let everyone = subscribers.clone();
    connection.data_handler(move |chunk| {
        let targets = everyone.lock().clone();
        for target in targets {
            broadcast.send(target, chunk.clone());
        }
    });

    let leaving = mailbox.clone();
    let everyone = subscribers.clone();
    connection.closed_handler(move || {
        leaving.unregister(id);
        everyone.lock().retain(|other| *other != id);
        info!(handler_id = %id, "client left");
    });
}
