use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strand_core::{Error, HandlerId, Runtime, RuntimeConfig, current_context};

const TIMEOUT: Duration = Duration::from_secs(5);

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::new().workers(3)).unwrap()
}

#[test]
fn test_first_handler_id_is_one() {
    let runtime = runtime();
    let mailbox = runtime.mailbox::<u32>();
    let context = runtime.create_context();

    let first = mailbox.register(context, |_| {}).unwrap();
    let second = mailbox.register(context, |_| {}).unwrap();

    assert_eq!(first, HandlerId::from_u64(1));
    assert_eq!(second.as_u64(), 2);
    assert_eq!(mailbox.len(), 2);
    runtime.shutdown();
}

#[test]
fn test_send_runs_handler_on_owning_context() {
    let runtime = runtime();
    let mailbox = runtime.mailbox::<&'static str>();
    let owner = runtime.create_context();
    let sender = runtime.create_context();
    let (tx, rx) = mpsc::channel();

    let id = mailbox
        .register(owner, move |msg| tx.send((msg, current_context())).unwrap())
        .unwrap();

    let outbox = mailbox.clone();
    runtime.run_on(sender, move || outbox.send(id, "foo")).unwrap();

    let (msg, seen) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(msg, "foo");
    assert_eq!(seen, Some(owner));
    runtime.shutdown();
}

#[test]
fn test_send_from_owning_context_is_synchronous() {
    let runtime = runtime();
    let mailbox = runtime.mailbox::<u32>();
    let context = runtime.create_context();
    let received = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&received);
    let id = mailbox
        .register(context, move |n| sink.lock().unwrap().push(n))
        .unwrap();

    let (tx, rx) = mpsc::channel();
    let inbox = mailbox.clone();
    let seen = Arc::clone(&received);
    runtime
        .run_on(context, move || {
            inbox.send(id, 7);
            tx.send(seen.lock().unwrap().clone()).unwrap();
        })
        .unwrap();

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), vec![7]);
    runtime.shutdown();
}

#[test]
fn test_send_to_unknown_handler_is_noop() {
    let runtime = runtime();
    let mailbox = runtime.mailbox::<String>();

    mailbox.send(HandlerId::from_u64(999), "lost".to_string());
    assert!(mailbox.is_empty());
    runtime.shutdown();
}

#[test]
fn test_unregister_is_idempotent() {
    let runtime = runtime();
    let mailbox = runtime.mailbox::<u32>();
    let context = runtime.create_context();
    let id = mailbox.register(context, |_| {}).unwrap();

    assert!(mailbox.unregister(id));
    assert!(!mailbox.unregister(id));
    assert!(!mailbox.unregister(HandlerId::from_u64(12345)));
    assert!(!mailbox.contains(id));
    runtime.shutdown();
}

#[test]
fn test_unregister_on_owner_discards_queued_message() {
    let runtime = runtime();
    let mailbox = runtime.mailbox::<u32>();
    let context = runtime.create_context();
    let received = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&received);
    let id = mailbox
        .register(context, move |n| sink.lock().unwrap().push(n))
        .unwrap();

    let (tx, rx) = mpsc::channel();
    let inbox = mailbox.clone();
    runtime
        .run_on(context, move || {
            // Queue behind this work item, then remove the handler first
            let outbox = inbox.clone();
            std::thread::spawn(move || outbox.send(id, 1)).join().unwrap();
            inbox.unregister(id);
        })
        .unwrap();
    runtime.run_on(context, move || tx.send(()).unwrap()).unwrap();

    rx.recv_timeout(TIMEOUT).unwrap();
    assert!(received.lock().unwrap().is_empty());
    runtime.shutdown();
}

#[test]
fn test_register_on_unknown_context_fails() {
    let runtime = runtime();
    let mailbox = runtime.mailbox::<u32>();
    let context = runtime.create_context();
    runtime.destroy_context(context);

    let result = mailbox.register(context, |_| {});
    assert!(matches!(result, Err(Error::UnboundExecution(_))));
    runtime.shutdown();
}

#[test]
fn test_register_current_requires_context() {
    let runtime = runtime();
    let mailbox = runtime.mailbox::<u32>();

    let result = mailbox.register_current(|_| {});
    assert!(matches!(result, Err(Error::UnboundExecution(_))));

    let context = runtime.create_context();
    let (tx, rx) = mpsc::channel();
    let inbox = mailbox.clone();
    runtime
        .run_on(context, move || {
            tx.send(inbox.register_current(|_| {}).map_err(|e| e.to_string()))
                .unwrap();
        })
        .unwrap();

    let id = rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(mailbox.context_of(id), Some(context));
    runtime.shutdown();
}

#[test]
fn test_fanout_between_contexts() {
    let runtime = runtime();
    let mailbox = runtime.mailbox::<u32>();
    let (tx, rx) = mpsc::channel();

    let mut ids = Vec::new();
    for _ in 0..5 {
        let context = runtime.create_context();
        let tx = tx.clone();
        let id = mailbox
            .register(context, move |n| {
                tx.send((context, current_context(), n)).unwrap()
            })
            .unwrap();
        ids.push(id);
    }

    let sender = runtime.create_context();
    let outbox = mailbox.clone();
    runtime
        .run_on(sender, move || {
            for id in ids {
                outbox.send(id, 42);
            }
        })
        .unwrap();

    for _ in 0..5 {
        let (owner, seen, n) = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(Some(owner), seen);
        assert_eq!(n, 42);
    }
    runtime.shutdown();
}
