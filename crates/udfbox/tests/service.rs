//! End-to-end tests against the sample UDF binaries.
//!
//! These spawn real sandboxed workers, so they need root (namespace
//! privileges) and a standard FHS layout for `/lib` + `/lib64`. Each test
//! holds the `SERIAL` lock for its whole service lifetime: the pool's
//! reaper waits on any child of the process, so two live services in one
//! test process would steal each other's exits.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use udfbox::{
    BinarySource, CodeToken, Completion, Config, ExecuteRequest, InvocationError, LoadError,
    LogError, UdfService,
};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn can_sandbox() -> bool {
    // Namespace creation in the launcher needs CAP_SYS_ADMIN.
    unsafe { libc::geteuid() == 0 }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn service() -> UdfService {
    init_tracing();
    UdfService::new(Config::new().acquire_timeout(Duration::from_millis(500)))
        .expect("service should start")
}

fn load(service: &UdfService, bin: &str, workers: usize, logs: bool) -> CodeToken {
    service
        .load_binary(BinarySource::Path(bin.as_ref()), workers, logs)
        .expect("binary should load")
}

fn execute(service: &UdfService, request: ExecuteRequest) -> Receiver<Completion> {
    let (tx, rx) = channel();
    service.execute(request, move |completion| {
        tx.send(completion).expect("test receiver alive");
    }, None);
    rx
}

fn execute_with_logs(
    service: &UdfService,
    request: ExecuteRequest,
) -> (Receiver<Completion>, Receiver<Result<String, LogError>>) {
    let (tx, rx) = channel();
    let (log_tx, log_rx) = channel();
    service.execute(
        request,
        move |completion| {
            tx.send(completion).expect("test receiver alive");
        },
        Some(Box::new(move |logs| {
            log_tx.send(logs).expect("test receiver alive");
        })),
    );
    (rx, log_rx)
}

fn wait_for_idle(service: &UdfService, token: &CodeToken, want: usize, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if service.pool_stats(token).is_some_and(|s| s.idle >= want) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    false
}

#[test]
fn echo_hello_and_replacement_worker() {
    let _guard = serial();
    if !can_sandbox() {
        eprintln!("skipping: requires root for namespaces");
        return;
    }
    let service = service();
    let token = load(&service, env!("CARGO_BIN_EXE_hello_udf"), 1, false);

    let mut metadata = HashMap::new();
    metadata.insert("trace".to_owned(), "abc-123".to_owned());
    let rx = execute(
        &service,
        ExecuteRequest::new(token.clone(), Vec::new()).metadata(metadata),
    );

    let completion = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(completion.result.unwrap(), b"Hello, world!");
    assert_eq!(completion.metadata.get("trace").unwrap(), "abc-123");

    // The consumed worker is replaced.
    assert!(
        wait_for_idle(&service, &token, 1, Duration::from_secs(1)),
        "replacement worker should be idle within a second"
    );
    service.shutdown();
}

#[test]
fn prime_sieve_is_deterministic() {
    let _guard = serial();
    if !can_sandbox() {
        eprintln!("skipping: requires root for namespaces");
        return;
    }
    let service = service();
    let token = load(&service, env!("CARGO_BIN_EXE_sieve_udf"), 1, false);

    let rx = execute(
        &service,
        ExecuteRequest::new(token, 100_000u64.to_le_bytes().to_vec()),
    );
    let completion = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    let payload = completion.result.unwrap();

    let primes: Vec<u32> = payload
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    assert_eq!(primes.len(), 9592);
    assert_eq!(primes.first(), Some(&2));
    assert_eq!(primes.last(), Some(&99991));
    service.shutdown();
}

#[test]
fn cancel_kills_the_assigned_worker() {
    let _guard = serial();
    if !can_sandbox() {
        eprintln!("skipping: requires root for namespaces");
        return;
    }
    let service = service();
    let token = load(&service, env!("CARGO_BIN_EXE_pause_udf"), 1, false);

    let (tx, rx) = channel();
    let execution = service.execute(
        ExecuteRequest::new(token.clone(), Vec::new()),
        move |completion| {
            tx.send(completion).expect("test receiver alive");
        },
        None,
    );

    std::thread::sleep(Duration::from_millis(100));
    service.cancel(&execution);

    let completion = rx.recv_timeout(Duration::from_millis(500)).unwrap();
    let err = completion.result.unwrap_err();
    assert!(matches!(err, InvocationError::Cancelled), "got {err:?}");

    // A second cancel after the terminal state is a no-op.
    service.cancel(&execution);

    assert!(
        wait_for_idle(&service, &token, 1, Duration::from_secs(1)),
        "pool should return to its target population"
    );
    service.shutdown();
}

#[test]
fn deadline_expiry_kills_the_worker() {
    let _guard = serial();
    if !can_sandbox() {
        eprintln!("skipping: requires root for namespaces");
        return;
    }
    let service = service();
    let token = load(&service, env!("CARGO_BIN_EXE_pause_udf"), 1, false);

    let rx = execute(
        &service,
        ExecuteRequest::new(token.clone(), Vec::new()).deadline(Duration::from_millis(200)),
    );
    let completion = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(matches!(
        completion.result.unwrap_err(),
        InvocationError::DeadlineExceeded
    ));
    assert!(wait_for_idle(&service, &token, 1, Duration::from_secs(1)));
    service.shutdown();
}

#[test]
fn delete_drains_all_workers() {
    let _guard = serial();
    if !can_sandbox() {
        eprintln!("skipping: requires root for namespaces");
        return;
    }
    let worker_dirs_before = pivot_dir_count();
    let service = service();
    let token = load(&service, env!("CARGO_BIN_EXE_hello_udf"), 4, false);
    assert!(
        wait_for_idle(&service, &token, 4, Duration::from_secs(5)),
        "population should converge to worker_count"
    );

    service.delete(&token);
    assert!(service.pool_stats(&token).is_none());
    assert_eq!(
        pivot_dir_count(),
        worker_dirs_before,
        "every pivot-root directory should be gone after delete"
    );

    let rx = execute(&service, ExecuteRequest::new(token, Vec::new()));
    let completion = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(matches!(
        completion.result.unwrap_err(),
        InvocationError::Deleted
    ));
    service.shutdown();
}

#[test]
fn worker_crash_surfaces_and_pool_recovers() {
    let _guard = serial();
    if !can_sandbox() {
        eprintln!("skipping: requires root for namespaces");
        return;
    }
    let service = service();
    let token = load(&service, env!("CARGO_BIN_EXE_exit_udf"), 1, false);

    let rx = execute(&service, ExecuteRequest::new(token.clone(), Vec::new()));
    let completion = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(
        completion.result.unwrap_err(),
        InvocationError::WorkerCrashed
    ));
    assert!(wait_for_idle(&service, &token, 1, Duration::from_secs(1)));
    service.shutdown();
}

#[test]
fn log_egress_is_opt_in() {
    let _guard = serial();
    if !can_sandbox() {
        eprintln!("skipping: requires root for namespaces");
        return;
    }
    let service = service();
    let bin = env!("CARGO_BIN_EXE_chatter_udf");

    let silent = load(&service, bin, 1, false);
    let (rx, log_rx) = execute_with_logs(&service, ExecuteRequest::new(silent, Vec::new()));
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap().result.unwrap(),
        b"done"
    );
    let logs = log_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(matches!(logs, Err(LogError::NotFound)), "got {logs:?}");

    let chatty = load(&service, bin, 1, true);
    let (rx, log_rx) = execute_with_logs(&service, ExecuteRequest::new(chatty, Vec::new()));
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap().result.unwrap(),
        b"done"
    );
    let logs = log_rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
    assert_eq!(logs, "line1\nline2\n");
    service.shutdown();
}

#[test]
fn busy_pool_rejects_within_the_bound() {
    let _guard = serial();
    if !can_sandbox() {
        eprintln!("skipping: requires root for namespaces");
        return;
    }
    let service = service();
    let token = load(&service, env!("CARGO_BIN_EXE_pause_udf"), 1, false);

    let (tx, first_rx) = channel();
    let first = service.execute(
        ExecuteRequest::new(token.clone(), Vec::new()),
        move |completion| {
            tx.send(completion).expect("test receiver alive");
        },
        None,
    );

    // The only worker is busy; the bound expires and the second
    // invocation is rejected without disturbing the first.
    let second_rx = execute(&service, ExecuteRequest::new(token.clone(), Vec::new()));
    let rejected = second_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(matches!(
        rejected.result.unwrap_err(),
        InvocationError::NoIdleWorker
    ));

    service.cancel(&first);
    let cancelled = first_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(matches!(
        cancelled.result.unwrap_err(),
        InvocationError::Cancelled
    ));
    service.shutdown();
}

#[test]
fn load_validates_worker_count() {
    let _guard = serial();
    if !can_sandbox() {
        eprintln!("skipping: requires root for namespaces");
        return;
    }
    let service = service();
    let bytes = std::fs::read(env!("CARGO_BIN_EXE_hello_udf")).unwrap();

    let err = service
        .load_binary(BinarySource::Bytes(&bytes), 0, false)
        .unwrap_err();
    assert!(matches!(err, LoadError::InvalidWorkerCount));

    let err = service
        .load_binary(BinarySource::Bytes(&bytes), 10_000, false)
        .unwrap_err();
    assert!(matches!(err, LoadError::TooManyWorkers { .. }));
    service.shutdown();
}

#[test]
fn load_from_bytes_round_trips() {
    let _guard = serial();
    if !can_sandbox() {
        eprintln!("skipping: requires root for namespaces");
        return;
    }
    let service = service();
    let bytes = std::fs::read(env!("CARGO_BIN_EXE_hello_udf")).unwrap();
    let token = service
        .load_binary(BinarySource::Bytes(&bytes), 1, false)
        .unwrap();

    let rx = execute(&service, ExecuteRequest::new(token, Vec::new()));
    let completion = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(completion.result.unwrap(), b"Hello, world!");
    service.shutdown();
}

/// Workers park their pivot roots under the system temp directory with a
/// fixed prefix; counting them observes cleanup.
fn pivot_dir_count() -> usize {
    let tmp = std::env::temp_dir();
    std::fs::read_dir(tmp)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| {
                    e.file_name()
                        .to_string_lossy()
                        .starts_with("udfbox-worker-")
                })
                .count()
        })
        .unwrap_or(0)
}
