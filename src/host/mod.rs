//! Host controller: creates the mailbox segment, supervises the worker and
//! serializes requests.
//!
//! At most one request is in flight per mailbox; `&mut self` on every
//! request operation is what enforces the single-flight discipline. A
//! transport failure (dead worker, deadline breach) tears the worker down
//! and every further operation fails until [`HostController::initialize`]
//! is run again. Semantic failures (compilation or runtime errors) are
//! returned to the caller and leave the worker alive.

mod child;

pub use child::WorkerChild;

use crate::error::{Error, Result};
use crate::mailbox::{Mailbox, RequestKind, ResponseStatus};
use crate::segment::{self, SharedSegment};
use std::env;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

/// Environment variable overriding the worker binary location.
pub const WORKER_PATH_ENV: &str = "OUTPOST_WORKER";

/// Configuration for the host controller.
#[derive(Clone, Debug)]
pub struct HostConfig {
    /// Worker binary to spawn.
    pub worker_path: PathBuf,
    /// Segment name; defaults to `/xcpp_shm_<pid>` when unset.
    pub segment_name: Option<String>,
    /// Per-request deadline.
    pub response_timeout: Duration,
    /// Sleep between polls of the response flag.
    pub poll_interval: Duration,
    /// How long the worker gets to survive its own startup.
    pub startup_grace: Duration,
    /// Pause between the shutdown request and SIGTERM.
    pub shutdown_grace: Duration,
    /// How long reaps wait before escalating.
    pub reap_deadline: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            worker_path: default_worker_path(),
            segment_name: None,
            response_timeout: Duration::from_secs(100),
            poll_interval: Duration::from_millis(1),
            startup_grace: Duration::from_millis(100),
            shutdown_grace: Duration::from_millis(100),
            reap_deadline: Duration::from_secs(2),
        }
    }
}

impl HostConfig {
    /// Override the worker binary path.
    pub fn with_worker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_path = path.into();
        self
    }

    /// Override the segment name (required when several hosts share a pid
    /// namespace, e.g. a test harness).
    pub fn with_segment_name(mut self, name: impl Into<String>) -> Self {
        self.segment_name = Some(name.into());
        self
    }

    /// Override the per-request deadline.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Override the response poll cadence.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Resolve the worker binary: env override, then a sibling of the current
/// executable, then PATH lookup.
fn default_worker_path() -> PathBuf {
    if let Ok(path) = env::var(WORKER_PATH_ENV) {
        return PathBuf::from(path);
    }
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("outpost-worker")))
        .unwrap_or_else(|| PathBuf::from("outpost-worker"))
}

/// Result of a `process_code` request.
///
/// `compiled == false` is not a transport error; the diagnostics are in
/// `stderr` and the worker stays usable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Captured standard output of the fragment.
    pub stdout: String,
    /// Captured standard error (compiler diagnostics included).
    pub stderr: String,
    /// Whether the fragment compiled.
    pub compiled: bool,
}

/// Owner of the segment and the worker process.
pub struct HostController {
    config: HostConfig,
    segment: Option<SharedSegment>,
    child: Option<WorkerChild>,
    initialized: bool,
}

impl HostController {
    /// Build an idle controller; nothing is allocated until `initialize`.
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            segment: None,
            child: None,
            initialized: false,
        }
    }

    /// Whether a worker is believed to be serving requests.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// OS pid of the worker, when one is running.
    pub fn worker_pid(&self) -> Option<u32> {
        self.child.as_ref().map(WorkerChild::id)
    }

    /// The active configuration.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Create the segment, spawn the worker and verify it survives startup.
    ///
    /// A no-op when already initialized. Every failure path runs
    /// [`cleanup`](Self::cleanup) before returning.
    pub fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        if let Err(e) = self.try_initialize() {
            self.cleanup();
            return Err(e);
        }
        Ok(())
    }

    fn try_initialize(&mut self) -> Result<()> {
        let name = self
            .config
            .segment_name
            .clone()
            .unwrap_or_else(segment::default_segment_name);

        let shared = SharedSegment::create(&name, Mailbox::SIZE)?;
        shared.mailbox().reset();
        tracing::info!(name = %name, size = shared.len(), "mailbox segment created");
        self.segment = Some(shared);

        let mut child = WorkerChild::spawn(&self.config.worker_path, &name, None)?;

        // Give the worker a moment, then make sure it did not die on the
        // doorstep (bad segment, missing interpreter, ...).
        thread::sleep(self.config.startup_grace);
        match child.try_reap() {
            Ok(None) => {}
            Ok(Some(status)) => {
                child.join_drainers();
                return Err(Error::Spawn(format!("worker exited during startup: {status}")));
            }
            Err(e) => {
                child.join_drainers();
                return Err(e);
            }
        }

        tracing::info!(pid = child.id(), "worker ready");
        self.child = Some(child);
        self.initialized = true;
        Ok(())
    }

    /// Compile and run a fragment; returns captured output and the compile
    /// status.
    pub fn process_code(&mut self, code: &str) -> Result<ProcessOutcome> {
        self.submit(RequestKind::ProcessCode, code, None)?;
        let mailbox = self.mailbox()?;
        match mailbox.response_status() {
            Some(ResponseStatus::Success) | Some(ResponseStatus::CompilationError) => {
                Ok(ProcessOutcome {
                    stdout: mailbox.output(),
                    stderr: mailbox.error_text(),
                    compiled: mailbox.compilation_result(),
                })
            }
            Some(ResponseStatus::RuntimeError) | Some(ResponseStatus::SystemError) => {
                Err(Error::Worker(mailbox.error_text()))
            }
            Some(ResponseStatus::None) | None => {
                Err(Error::Worker("worker published no status".into()))
            }
        }
    }

    /// Complete the identifier at a 0-based byte cursor within `code`.
    pub fn code_complete(&mut self, code: &str, cursor: i32) -> Result<Vec<String>> {
        if cursor < 0 || cursor as usize > code.len() {
            return Err(Error::InvalidRequest(format!(
                "cursor {cursor} outside 0..={}",
                code.len()
            )));
        }
        self.submit(RequestKind::CodeComplete, code, Some(cursor))?;
        let mailbox = self.mailbox()?;
        match mailbox.response_status() {
            Some(ResponseStatus::Success) => Ok(mailbox.completions()),
            _ => Err(Error::Worker(mailbox.error_text())),
        }
    }

    /// Evaluate an expression to a 64-bit integer.
    pub fn evaluate(&mut self, code: &str) -> Result<i64> {
        self.submit(RequestKind::Evaluate, code, None)?;
        let mailbox = self.mailbox()?;
        match mailbox.response_status() {
            Some(ResponseStatus::Success) => Ok(mailbox.evaluation_result()),
            Some(ResponseStatus::RuntimeError) => Err(Error::Runtime(mailbox.error_text())),
            _ => Err(Error::Worker(mailbox.error_text())),
        }
    }

    /// Graceful stop: shutdown request, SIGTERM, reap, then full cleanup.
    ///
    /// Always safe to call, in any state.
    pub fn shutdown(&mut self) {
        if self.initialized {
            if let Some(shared) = self.segment.as_ref() {
                let mailbox = shared.mailbox();
                mailbox.reset();
                mailbox.post_request(RequestKind::Shutdown);
            }
            thread::sleep(self.config.shutdown_grace);
        }
        if let Some(child) = self.child.as_mut() {
            child.signal_term();
            if let Some(status) = child.reap_with_deadline(self.config.reap_deadline) {
                tracing::info!(%status, "worker exited");
            } else {
                tracing::warn!("worker ignored SIGTERM");
            }
        }
        self.cleanup();
    }

    /// Forcibly release everything: kill the worker's process group, reap,
    /// join the drainers, unmap and unlink the segment.
    ///
    /// Idempotent and safe on partially-initialized state.
    pub fn cleanup(&mut self) {
        self.initialized = false;
        if let Some(mut child) = self.child.take() {
            child.kill_group();
            if child.reap_with_deadline(self.config.reap_deadline).is_none() {
                tracing::warn!(pid = child.id(), "worker unreaped after SIGKILL");
            }
            child.join_drainers();
        }
        if let Some(shared) = self.segment.take() {
            tracing::debug!(name = %shared.name(), "releasing mailbox segment");
            drop(shared);
        }
    }

    fn mailbox(&self) -> Result<&Mailbox> {
        self.segment
            .as_ref()
            .map(SharedSegment::mailbox)
            .ok_or(Error::NotInitialized)
    }

    /// Steps 1-5 of the request protocol, then the supervised wait.
    fn submit(&mut self, kind: RequestKind, code: &str, cursor: Option<i32>) -> Result<()> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        {
            let mailbox = self.mailbox()?;
            mailbox.reset();
            mailbox.set_code(code);
            if let Some(cursor) = cursor {
                mailbox.set_cursor(cursor);
            }
            mailbox.post_request(kind);
        }
        self.wait_for_response()
    }

    /// Poll for `response_ready`, reaping the child each cycle. Both failure
    /// modes declare the worker untrusted and tear it down.
    fn wait_for_response(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.config.response_timeout;
        loop {
            if self.mailbox()?.response_pending() {
                return Ok(());
            }

            if let Some(child) = self.child.as_mut() {
                match child.try_reap() {
                    Ok(None) => {}
                    Ok(Some(status)) => {
                        tracing::warn!(%status, "worker exited while a request was pending");
                        self.cleanup();
                        return Err(Error::WorkerExited(status.to_string()));
                    }
                    Err(e) => {
                        self.cleanup();
                        return Err(e);
                    }
                }
            }

            if Instant::now() >= deadline {
                tracing::warn!("response deadline exceeded, tearing the worker down");
                self.cleanup();
                return Err(Error::ResponseTimeout(self.config.response_timeout));
            }

            thread::sleep(self.config.poll_interval);
        }
    }
}

impl Drop for HostController {
    fn drop(&mut self) {
        self.cleanup();
    }
}
