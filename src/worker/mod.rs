//! Worker process: attaches the mailbox segment, owns the interpreter and
//! serves requests until shutdown.
//!
//! The worker is single-threaded with respect to the mailbox. Its only
//! auxiliary activity is the orphan watchdog, which never touches shared
//! memory.

mod includes;
mod orphan;

pub use includes::{
    RESOURCE_DIR_ENV, compiler_args, detect_resource_dir, detect_system_include_paths,
    sanitize_include_paths,
};
pub use orphan::{ORPHAN_CHECK_INTERVAL, orphaned, spawn_watchdog};

use crate::error::Result;
use crate::interpreter::{CaptureStream, EmbeddedInterpreter, Interpreter};
use crate::mailbox::{Mailbox, RequestKind, ResponseStatus};
use crate::segment::{self, SharedSegment};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Configuration for a worker.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Name of the segment created by the host.
    pub segment_name: String,
    /// Mapping size; clamped to `[Mailbox::SIZE, system max]`.
    pub segment_size: usize,
    /// Sleep between polls of the request flag.
    pub poll_interval: Duration,
    /// Delay between attempts to open the segment.
    pub attach_backoff: Duration,
    /// Number of open attempts before giving up.
    pub attach_attempts: u32,
    /// Cadence of the orphan watchdog.
    pub orphan_check_interval: Duration,
}

impl WorkerConfig {
    /// Configuration for the given segment with default timings.
    pub fn new(segment_name: impl Into<String>) -> Self {
        Self {
            segment_name: segment_name.into(),
            segment_size: Mailbox::SIZE,
            poll_interval: Duration::from_millis(10),
            attach_backoff: segment::OPEN_RETRY_BACKOFF,
            attach_attempts: segment::OPEN_RETRY_ATTEMPTS,
            orphan_check_interval: ORPHAN_CHECK_INTERVAL,
        }
    }

    /// Override the mapping size (clamped to sane bounds).
    pub fn with_segment_size(mut self, size: usize) -> Self {
        self.segment_size = segment::clamp_segment_size(size);
        self
    }

    /// Override the poll cadence.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Override the attach retry schedule.
    pub fn with_attach_retry(mut self, backoff: Duration, attempts: u32) -> Self {
        self.attach_backoff = backoff;
        self.attach_attempts = attempts;
        self
    }
}

/// The worker side of the bridge, generic over the interpreter backend.
pub struct Worker<I> {
    segment: SharedSegment,
    interpreter: I,
    shutdown: Arc<AtomicBool>,
    config: WorkerConfig,
}

impl Worker<EmbeddedInterpreter> {
    /// Attach to the host's segment and build the default backend with the
    /// assembled compiler arguments.
    pub fn attach(config: WorkerConfig) -> Result<Self> {
        let args = includes::compiler_args();
        let interpreter = EmbeddedInterpreter::create(&args)?;
        Self::with_interpreter(config, interpreter)
    }
}

impl<I: Interpreter> Worker<I> {
    /// Attach to the host's segment with a caller-provided backend.
    ///
    /// The mailbox is reset exactly once here, before any request can be
    /// observed; during the request cycle only the host resets.
    pub fn with_interpreter(config: WorkerConfig, interpreter: I) -> Result<Self> {
        let segment = SharedSegment::open_with_retry(
            &config.segment_name,
            config.segment_size,
            config.attach_backoff,
            config.attach_attempts,
        )?;
        segment.mailbox().reset();
        tracing::info!(name = %config.segment_name, size = segment.len(), "worker attached");
        Ok(Self {
            segment,
            interpreter,
            shutdown: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    /// Register SIGINT and SIGTERM to raise the shutdown flag checked
    /// between poll iterations.
    pub fn install_signal_flags(&self) -> Result<()> {
        for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&self.shutdown))?;
        }
        Ok(())
    }

    /// Start the orphan watchdog at this worker's cadence.
    pub fn spawn_orphan_watchdog(&self) -> Result<()> {
        orphan::spawn_watchdog(self.config.orphan_check_interval)
    }

    /// The flag raised by signal handlers (and tests) to stop the loop.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Serve requests until a `Shutdown` request or a signal.
    pub fn run(&mut self) -> Result<()> {
        tracing::info!("worker started, waiting for requests");
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                tracing::info!("shutdown signal observed");
                break;
            }
            if self.segment.mailbox().request_pending() {
                let (status, stop) = self.dispatch();
                self.segment.mailbox().publish_response(status);
                if stop {
                    break;
                }
            } else {
                thread::sleep(self.config.poll_interval);
            }
        }
        tracing::info!("worker loop exited");
        Ok(())
    }

    fn dispatch(&mut self) -> (ResponseStatus, bool) {
        match self.segment.mailbox().request_kind() {
            Some(RequestKind::ProcessCode) => self.handle_process_code(),
            Some(RequestKind::CodeComplete) => self.handle_code_complete(),
            Some(RequestKind::Evaluate) => self.handle_evaluate(),
            Some(RequestKind::Shutdown) => {
                tracing::info!("shutdown requested by host");
                (ResponseStatus::Success, true)
            }
            Some(RequestKind::None) | None => {
                tracing::warn!("request flag raised with no valid request kind");
                self.segment.mailbox().set_error("unknown request kind");
                (ResponseStatus::SystemError, false)
            }
        }
    }

    fn handle_process_code(&mut self) -> (ResponseStatus, bool) {
        let code = self.segment.mailbox().code();
        tracing::debug!(bytes = code.len(), "processing code fragment");

        // Stacked captures, ended in LIFO order: stdout was begun last, so
        // it is ended first.
        self.interpreter.begin_capture(CaptureStream::Stderr);
        self.interpreter.begin_capture(CaptureStream::Stdout);
        let compiled = self.interpreter.process(&code);
        let output = self.interpreter.end_capture();
        let errors = self.interpreter.end_capture();

        let mailbox = self.segment.mailbox();
        match compiled {
            Ok(ok) => {
                mailbox.set_compilation_result(ok);
                mailbox.set_output(&output);
                mailbox.set_error(&errors);
                if ok {
                    (ResponseStatus::Success, false)
                } else {
                    (ResponseStatus::CompilationError, false)
                }
            }
            Err(e) => {
                mailbox.set_error(&format!("code processing failed: {e}"));
                (ResponseStatus::SystemError, false)
            }
        }
    }

    fn handle_code_complete(&mut self) -> (ResponseStatus, bool) {
        let (code, cursor) = {
            let mailbox = self.segment.mailbox();
            (mailbox.code(), mailbox.cursor())
        };
        // The completion entry point expects a 1-based line and column; the
        // host sends a 0-based byte cursor into a single-line fragment.
        let col = u32::try_from(cursor.max(0)).unwrap_or(0).saturating_add(1);
        tracing::debug!(cursor, col, "completing");

        match self.interpreter.code_complete(&code, 1, col) {
            Ok(items) => {
                self.segment.mailbox().set_completions(&items);
                (ResponseStatus::Success, false)
            }
            Err(e) => {
                self.segment
                    .mailbox()
                    .set_error(&format!("code completion failed: {e}"));
                (ResponseStatus::SystemError, false)
            }
        }
    }

    fn handle_evaluate(&mut self) -> (ResponseStatus, bool) {
        let code = self.segment.mailbox().code();
        match self.interpreter.evaluate(&code) {
            Ok(value) => {
                self.segment.mailbox().set_evaluation_result(value);
                (ResponseStatus::Success, false)
            }
            Err(e) => {
                self.segment.mailbox().set_error(&e.to_string());
                (ResponseStatus::RuntimeError, false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn unique_name(tag: &str) -> String {
        format!("/outpost-worker-test-{}-{}", std::process::id(), tag)
    }

    fn wait_response(mailbox: &Mailbox) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !mailbox.response_pending() {
            assert!(Instant::now() < deadline, "no response from worker thread");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn worker_serves_requests_until_shutdown() {
        let name = unique_name("cycle");
        let host_side = SharedSegment::create(&name, Mailbox::SIZE).unwrap();
        host_side.mailbox().reset();

        let config = WorkerConfig::new(&name).with_poll_interval(Duration::from_millis(1));
        let mut worker = Worker::attach(config).unwrap();
        let handle = thread::spawn(move || worker.run());

        let mailbox = host_side.mailbox();

        mailbox.reset();
        mailbox.set_code("40 + 2");
        mailbox.post_request(RequestKind::Evaluate);
        wait_response(mailbox);
        assert_eq!(mailbox.response_status(), Some(ResponseStatus::Success));
        assert_eq!(mailbox.evaluation_result(), 42);
        assert!(!mailbox.request_pending());

        mailbox.reset();
        mailbox.set_code("std::cout << \"hi\" << std::endl;");
        mailbox.post_request(RequestKind::ProcessCode);
        wait_response(mailbox);
        assert_eq!(mailbox.response_status(), Some(ResponseStatus::Success));
        assert!(mailbox.compilation_result());
        assert_eq!(mailbox.output(), "hi\n");

        mailbox.reset();
        mailbox.post_request(RequestKind::Shutdown);
        wait_response(mailbox);
        assert_eq!(mailbox.response_status(), Some(ResponseStatus::Success));

        handle.join().unwrap().unwrap();
    }

    #[test]
    fn evaluation_failure_reports_runtime_error() {
        let name = unique_name("runtime");
        let host_side = SharedSegment::create(&name, Mailbox::SIZE).unwrap();
        host_side.mailbox().reset();

        let config = WorkerConfig::new(&name).with_poll_interval(Duration::from_millis(1));
        let mut worker = Worker::attach(config).unwrap();
        let handle = thread::spawn(move || worker.run());

        let mailbox = host_side.mailbox();
        mailbox.reset();
        mailbox.set_code("1 / 0");
        mailbox.post_request(RequestKind::Evaluate);
        wait_response(mailbox);
        assert_eq!(mailbox.response_status(), Some(ResponseStatus::RuntimeError));
        assert!(mailbox.error_text().contains("division by zero"));

        mailbox.reset();
        mailbox.post_request(RequestKind::Shutdown);
        wait_response(mailbox);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn signal_flag_stops_the_loop() {
        let name = unique_name("flag");
        let host_side = SharedSegment::create(&name, Mailbox::SIZE).unwrap();
        host_side.mailbox().reset();

        let config = WorkerConfig::new(&name).with_poll_interval(Duration::from_millis(1));
        let mut worker = Worker::attach(config).unwrap();
        let flag = worker.shutdown_flag();
        let handle = thread::spawn(move || worker.run());

        flag.store(true, Ordering::Relaxed);
        handle.join().unwrap().unwrap();
    }
}
