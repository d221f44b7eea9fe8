//! Worker child-process handle.
//!
//! The worker runs in its own process group so that a group-directed
//! SIGKILL can never touch the host, and its stdout/stderr are piped back
//! and drained into the host's log stream.

use crate::error::{Error, Result};
use rustix::process::{Pid, Signal};
use std::io::{BufRead, BufReader};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A spawned worker process plus its log drainers.
pub struct WorkerChild {
    child: Child,
    drainers: Vec<JoinHandle<()>>,
}

impl WorkerChild {
    /// Spawn `worker <segment_name> [size_bytes]` with piped diagnostics.
    pub fn spawn(worker: &Path, segment_name: &str, segment_size: Option<usize>) -> Result<Self> {
        let mut command = Command::new(worker);
        command
            .arg(segment_name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(size) = segment_size {
            command.arg(size.to_string());
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::Spawn(format!("exec {} failed: {e}", worker.display())))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut drainers = Vec::new();
        let spawned = (|| {
            if let Some(out) = stdout {
                drainers.push(drain("worker-stdout", out)?);
            }
            if let Some(err) = stderr {
                drainers.push(drain("worker-stderr", err)?);
            }
            Ok(())
        })();
        if let Err(e) = spawned {
            // No drainers means no diagnostics; don't leak the child.
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }

        tracing::info!(pid = child.id(), path = %worker.display(), "worker spawned");
        Ok(Self { child, drainers })
    }

    /// OS pid of the worker.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Non-blocking reap.
    pub fn try_reap(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    /// Reap with a deadline; `None` when the worker is still alive after it.
    pub fn reap_with_deadline(&mut self, deadline: Duration) -> Option<ExitStatus> {
        let start = Instant::now();
        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Some(status);
            }
            if start.elapsed() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Ask the worker to exit (SIGTERM). Errors (already dead) are ignored.
    pub fn signal_term(&self) {
        let _ = rustix::process::kill_process(Pid::from_child(&self.child), Signal::TERM);
    }

    /// SIGKILL the worker's whole process group.
    pub fn kill_group(&self) {
        let _ = rustix::process::kill_process_group(Pid::from_child(&self.child), Signal::KILL);
    }

    /// Join the log drainers. Call after the child is reaped so the pipes
    /// have reached EOF.
    pub fn join_drainers(&mut self) {
        for handle in self.drainers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn drain<R: std::io::Read + Send + 'static>(name: &'static str, reader: R) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
        for line in BufReader::new(reader).lines() {
            match line {
                Ok(line) => tracing::debug!(target: "outpost::worker_log", "{line}"),
                Err(_) => break,
            }
        }
    })?;
    Ok(handle)
}
