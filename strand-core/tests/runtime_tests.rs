use std::sync::mpsc;
use std::time::Duration;
use strand_core::{Error, Runtime, RuntimeConfig, current_context};

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn test_worker_count_follows_config() {
    let runtime = Runtime::new(RuntimeConfig::new().workers(3)).unwrap();
    assert_eq!(runtime.worker_count(), 3);
    assert!(runtime.is_running());
    runtime.shutdown();
}

#[test]
fn test_invalid_config_is_rejected() {
    let result = Runtime::new(RuntimeConfig::new().thread_name(""));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_execute_runs_on_fresh_context() {
    let runtime = Runtime::new(RuntimeConfig::new().workers(2)).unwrap();
    let (tx, rx) = mpsc::channel();

    let context = runtime.execute(move || tx.send(current_context()).unwrap()).unwrap();

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Some(context));
    assert!(runtime.registry().contains(context));
    runtime.shutdown();
}

#[test]
fn test_no_context_outside_workers() {
    let runtime = Runtime::new(RuntimeConfig::new().workers(1)).unwrap();
    assert_eq!(runtime.current_context(), None);
    assert_eq!(current_context(), None);
    runtime.shutdown();
}

#[test]
fn test_worker_survives_panicking_work() {
    let runtime = Runtime::new(RuntimeConfig::new().workers(1)).unwrap();
    let context = runtime.create_context();
    let (tx, rx) = mpsc::channel();

    runtime.run_on(context, || panic!("work item failure")).unwrap();
    runtime.run_on(context, move || tx.send(()).unwrap()).unwrap();

    rx.recv_timeout(TIMEOUT).unwrap();
    runtime.shutdown();
}

#[test]
fn test_shutdown_is_idempotent_and_rejects_work() {
    let runtime = Runtime::new(RuntimeConfig::new().workers(2)).unwrap();
    let context = runtime.create_context();

    runtime.shutdown();
    runtime.shutdown();

    assert!(!runtime.is_running());
    assert!(matches!(
        runtime.run_on(context, || {}),
        Err(Error::RuntimeShutdown)
    ));
    assert!(matches!(runtime.execute(|| {}), Err(Error::RuntimeShutdown)));
}

#[test]
fn test_shutdown_from_worker_does_not_deadlock() {
    let runtime = Runtime::new(RuntimeConfig::new().workers(2)).unwrap();
    let context = runtime.create_context();
    let (tx, rx) = mpsc::channel();

    let inner = runtime.clone();
    runtime
        .run_on(context, move || {
            inner.shutdown();
            tx.send(()).unwrap();
        })
        .unwrap();

    rx.recv_timeout(TIMEOUT).unwrap();
    assert!(!runtime.is_running());
}

#[test]
fn test_runtimes_do_not_share_contexts() {
    let first = Runtime::new(RuntimeConfig::new().workers(1)).unwrap();
    let second = Runtime::new(RuntimeConfig::new().workers(1)).unwrap();
    let context = first.create_context();
    let (tx, rx) = mpsc::channel();

    let other = second.clone();
    first
        .run_on(context, move || {
            tx.send((current_context(), other.current_context())).unwrap();
        })
        .unwrap();

    let (global, foreign) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(global, Some(context));
    assert_eq!(foreign, None);
    first.shutdown();
    second.shutdown();
}

#[test]
fn test_from_toml_config() {
    let config = RuntimeConfig::from_toml_str("workers = 2\nthread_name = \"toml-worker\"").unwrap();
    let runtime = Runtime::new(config).unwrap();
    let context = runtime.create_context();
    let (tx, rx) = mpsc::channel();

    runtime
        .run_on(context, move || {
            tx.send(std::thread::current().name().map(str::to_string))
                .unwrap();
        })
        .unwrap();

    let name = rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert!(name.starts_with("toml-worker-"));
    runtime.shutdown();
}
