//! Orphan detection.
//!
//! The worker's only defense against a host that dies without running its
//! teardown: a background thread watches for reparenting to init and exits
//! the process when it happens.

use crate::error::Result;
use std::thread;
use std::time::Duration;

/// How often the watchdog re-checks the parent pid.
pub const ORPHAN_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Whether this process has been reparented to init.
pub fn orphaned() -> bool {
    match rustix::process::getppid() {
        Some(parent) => parent.as_raw_nonzero().get() == 1,
        None => true,
    }
}

/// Start the detached watchdog thread.
///
/// When the parent disappears the worker exits immediately with status 1;
/// there is no point unwinding, the host-side resources are already gone.
pub fn spawn_watchdog(interval: Duration) -> Result<()> {
    thread::Builder::new()
        .name("orphan-watchdog".to_string())
        .spawn(move || loop {
            if orphaned() {
                tracing::error!("host process is gone, exiting");
                std::process::exit(1);
            }
            thread::sleep(interval);
        })?;
    Ok(())
}
