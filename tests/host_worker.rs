//! End-to-end tests driving the real worker binary over shared memory.
//!
//! These exercise the full bridge: segment creation, worker spawn, the
//! request/response protocol, crash recovery and teardown hygiene.

use outpost::error::Error;
use outpost::host::{HostConfig, HostController};
use outpost::mailbox::Mailbox;
use outpost::segment::SharedSegment;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

static NEXT_SEGMENT: AtomicU32 = AtomicU32::new(0);

fn test_config() -> (HostConfig, String) {
    let suffix = NEXT_SEGMENT.fetch_add(1, Ordering::Relaxed);
    let name = format!("/outpost-e2e-{}-{}", std::process::id(), suffix);
    let config = HostConfig::default()
        .with_worker_path(PathBuf::from(env!("CARGO_BIN_EXE_outpost-worker")))
        .with_segment_name(&name)
        .with_response_timeout(Duration::from_secs(15));
    (config, name)
}

fn started_host() -> (HostController, String) {
    let (config, name) = test_config();
    let mut host = HostController::new(config);
    host.initialize().expect("worker failed to initialize");
    (host, name)
}

#[test]
fn process_code_reports_compile_success() {
    let (mut host, _) = started_host();

    let outcome = host.process_code("int x = 1;").unwrap();
    assert!(outcome.compiled);
    assert!(outcome.stderr.is_empty());

    host.shutdown();
}

#[test]
fn process_code_reports_compile_failure_with_diagnostics() {
    let (mut host, _) = started_host();

    let outcome = host.process_code("int = ;").unwrap();
    assert!(!outcome.compiled);
    assert!(!outcome.stderr.is_empty());

    // A semantic failure leaves the worker alive.
    assert!(host.is_initialized());
    let outcome = host.process_code("int y = 2;").unwrap();
    assert!(outcome.compiled);

    host.shutdown();
}

#[test]
fn process_code_captures_stdout() {
    let (mut host, _) = started_host();

    let outcome = host
        .process_code("int n = 6; std::cout << n * 7 << std::endl;")
        .unwrap();
    assert!(outcome.compiled);
    assert_eq!(outcome.stdout, "42\n");

    host.shutdown();
}

#[test]
fn evaluate_returns_the_integer() {
    let (mut host, _) = started_host();

    assert_eq!(host.evaluate("40 + 2").unwrap(), 42);

    host.shutdown();
}

#[test]
fn interpreter_state_accumulates_across_requests() {
    let (mut host, _) = started_host();

    let outcome = host.process_code("int a = 40;").unwrap();
    assert!(outcome.compiled);
    assert_eq!(host.evaluate("a + 2").unwrap(), 42);

    host.shutdown();
}

#[test]
fn evaluate_surfaces_runtime_errors() {
    let (mut host, _) = started_host();

    let err = host.evaluate("1 / 0").unwrap_err();
    assert!(matches!(err, Error::Runtime(_)));
    // Runtime failures are semantic; the worker stays up.
    assert!(host.is_initialized());
    assert_eq!(host.evaluate("2 + 2").unwrap(), 4);

    host.shutdown();
}

#[test]
fn completion_returns_candidates_for_the_prefix() {
    let (mut host, _) = started_host();

    let results = host.code_complete("std::vec", 8).unwrap();
    assert!(!results.is_empty());
    assert!(results.iter().any(|c| c.starts_with("vec")));

    host.shutdown();
}

#[test]
fn request_fails_after_worker_death_and_host_recovers() {
    let (mut host, _) = started_host();

    let pid = host.worker_pid().expect("worker pid");
    let pid = rustix::process::Pid::from_raw(pid as i32).expect("nonzero pid");
    rustix::process::kill_process(pid, rustix::process::Signal::KILL).unwrap();

    let err = host.process_code("int x = 1;").unwrap_err();
    assert!(matches!(
        err,
        Error::WorkerExited(_) | Error::ResponseTimeout(_)
    ));
    assert!(!host.is_initialized());

    // Further operations fail until re-initialization.
    assert!(matches!(host.evaluate("1"), Err(Error::NotInitialized)));

    host.initialize().unwrap();
    assert_eq!(host.evaluate("40 + 2").unwrap(), 42);

    host.shutdown();
}

#[test]
fn shutdown_releases_the_segment_and_the_worker() {
    let (mut host, name) = started_host();

    assert_eq!(host.evaluate("1 + 1").unwrap(), 2);
    host.shutdown();

    assert!(!host.is_initialized());
    assert!(host.worker_pid().is_none());
    // The name was unlinked; nothing is left to open.
    assert!(SharedSegment::open(&name, Mailbox::SIZE).is_err());

    // And the controller is reusable.
    host.initialize().unwrap();
    assert_eq!(host.evaluate("2 + 2").unwrap(), 4);
    host.shutdown();
}

#[test]
fn cleanup_is_idempotent_after_failures() {
    let (config, name) = test_config();
    let mut host = HostController::new(config);
    host.initialize().unwrap();

    host.cleanup();
    host.cleanup();
    host.shutdown();

    assert!(SharedSegment::open(&name, Mailbox::SIZE).is_err());
}

#[test]
fn orphaned_worker_exits_on_its_own() {
    let suffix = NEXT_SEGMENT.fetch_add(1, Ordering::Relaxed);
    let name = format!("/outpost-e2e-orphan-{}-{}", std::process::id(), suffix);
    let segment = SharedSegment::create(&name, Mailbox::SIZE).unwrap();
    segment.mailbox().reset();

    // A throwaway parent spawns the worker and exits immediately, so the
    // worker is reparented to init and must notice on its own.
    let output = std::process::Command::new("sh")
        .args([
            "-c",
            r#""$1" "$2" >/dev/null 2>&1 & echo $!"#,
            "sh",
            env!("CARGO_BIN_EXE_outpost-worker"),
            &name,
        ])
        .output()
        .unwrap();
    assert!(output.status.success());
    let pid: u32 = String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .expect("worker pid on stdout");

    let proc_path = format!("/proc/{pid}");
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while std::path::Path::new(&proc_path).exists() {
        assert!(
            std::time::Instant::now() < deadline,
            "orphaned worker {pid} still alive"
        );
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[test]
fn worker_binary_rejects_missing_arguments() {
    let status = std::process::Command::new(env!("CARGO_BIN_EXE_outpost-worker"))
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
}

#[test]
fn worker_binary_rejects_garbage_size() {
    let status = std::process::Command::new(env!("CARGO_BIN_EXE_outpost-worker"))
        .args(["/outpost-nonexistent", "not-a-number"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
}

#[test]
fn worker_accepts_a_size_override() {
    let suffix = NEXT_SEGMENT.fetch_add(1, Ordering::Relaxed);
    let name = format!("/outpost-e2e-size-{}-{}", std::process::id(), suffix);

    // Host side of the handshake, driven manually to pass the override.
    let segment = SharedSegment::create(&name, Mailbox::SIZE).unwrap();
    segment.mailbox().reset();

    let mut child = std::process::Command::new(env!("CARGO_BIN_EXE_outpost-worker"))
        .args([name.as_str(), &Mailbox::SIZE.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .unwrap();

    // The worker resets the mailbox once while attaching; let that happen
    // before the first request goes in.
    std::thread::sleep(Duration::from_millis(300));

    let mailbox = segment.mailbox();
    mailbox.reset();
    mailbox.set_code("20 * 2 + 2");
    mailbox.post_request(outpost::mailbox::RequestKind::Evaluate);

    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    while !mailbox.response_pending() {
        assert!(std::time::Instant::now() < deadline, "no worker response");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(mailbox.evaluation_result(), 42);

    mailbox.reset();
    mailbox.post_request(outpost::mailbox::RequestKind::Shutdown);
    let status = child.wait().unwrap();
    assert!(status.success());
}
